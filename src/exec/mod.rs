//! Thread-pool executor family.
//!
//! # Module map
//! - `ctl`: packed (run-state, worker-count) lifecycle word.
//! - `task`: the [`Job`] seam, [`FutureTask`] state machine, waiter stack.
//! - `queue`: the [`WorkQueue`] seam and the FIFO [`SyncQueue`].
//! - `pool`: [`ThreadPool`] — dispatch, workers, shutdown, rejection, hooks.
//! - `completion`: [`CompletionQueue`] — futures in completion order.
//! - `delay`: [`DelayQueue`] min-heap with the leader/follower wait.
//! - `scheduled`: [`ScheduledPool`] — delayed and periodic execution.
//!
//! Blocking operations cooperate with [`crate::interrupt`]: shutdown wakes
//! idle workers, `cancel(true)` reaches a running task's thread, and every
//! wait that reports interruption consumes the flag.

pub mod completion;
pub(crate) mod ctl;
pub mod delay;
pub mod error;
pub mod pool;
pub mod queue;
pub mod scheduled;
pub mod task;

pub use completion::CompletionQueue;
pub use delay::{DelayQueue, SchedState};
pub use error::{Interrupted, InvokeError, JoinError, RejectedError};
pub use pool::{
    DefaultHooks, DefaultThreadFactory, PoolConfig, PoolHooks, RejectionPolicy, ThreadFactory,
    ThreadPool,
};
pub use queue::{SyncQueue, WorkQueue};
pub use scheduled::{ScheduledPool, ScheduledTask};
pub use task::{job_fn, FutureTask, Job, Task};
