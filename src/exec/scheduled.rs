//! Scheduled executor: delayed and periodic tasks over a worker pool.
//!
//! The pool's work queue is a [`DelayQueue`], so workers block in its
//! leader/follower `take` and receive tasks only when their trigger passes.
//!
//! # Task shapes
//! - one-shot (`period == 0`)
//! - fixed-rate (`period > 0`): next trigger = previous trigger + period;
//!   a run that overshoots its period makes the next one fire immediately,
//!   but runs never overlap — the task is only re-enqueued after it returns.
//! - fixed-delay (`period < 0`): next trigger = completion time + |period|.
//!
//! A periodic run goes through the future's run-and-reset (the future never
//! completes), advances the trigger and re-enqueues the same task object.
//! Failure or cancellation stops the period.
//!
//! # Shutdown policies
//! After `shutdown`: periodic tasks continue only with
//! `continue_periodic_after_shutdown` (default off); pending one-shot tasks
//! run only with `execute_delayed_after_shutdown` (default on) or when
//! already ripe. The on-shutdown hook walks the queue and cancels whatever
//! the policies exclude. `remove_on_cancel` additionally unlinks a
//! cancelled task from the heap at cancel time, so long-delay cancelled
//! tasks do not accumulate as tombstones.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use super::delay::{now_nanos, DelayQueue, SchedState};
use super::error::{Interrupted, JoinError, RejectedError};
use super::pool::{
    self, DefaultThreadFactory, PoolConfig, PoolHooks, PoolInner, RejectionPolicy, ThreadFactory,
    ThreadPool,
};
use super::queue::WorkQueue;
use super::task::{FutureTask, Job, Task};

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_millis(10);

pub(crate) struct SchedCtx {
    queue: Arc<DelayQueue>,
    pool: OnceLock<Weak<PoolInner>>,
    seq: AtomicU64,
    continue_periodic: AtomicBool,
    execute_delayed: AtomicBool,
    remove_on_cancel: AtomicBool,
}

impl SchedCtx {
    fn pool_inner(&self) -> Option<Arc<PoolInner>> {
        self.pool.get()?.upgrade()
    }

    /// Run-state plus after-shutdown policy check for one task shape.
    fn can_run(&self, periodic: bool, delay_nanos: i64) -> bool {
        let Some(pool) = self.pool_inner() else {
            return false;
        };
        if !pool.is_shutdown() {
            return true;
        }
        if pool.is_stopped() {
            return false;
        }
        if periodic {
            self.continue_periodic.load(Ordering::Relaxed)
        } else {
            self.execute_delayed.load(Ordering::Relaxed) || delay_nanos <= 0
        }
    }

    /// Re-enqueues a periodic task unless the run-state forbids it.
    fn re_execute_periodic(&self, task: Task) {
        if self.can_run(true, 0) {
            let _ = self.queue.offer(task.clone());
            if self.can_run(true, 0) || !self.queue.remove(&task) {
                if let Some(pool) = self.pool_inner() {
                    pool::ensure_prestart(&pool);
                }
                return;
            }
        }
        task.cancel(false);
    }
}

/// A scheduled (and possibly periodic) future.
pub struct ScheduledTask<T> {
    fut: FutureTask<T>,
    sched: SchedState,
    ctx: Arc<SchedCtx>,
    /// Self-reference handed back to the queue on periodic re-enqueue.
    outer: OnceLock<Weak<ScheduledTask<T>>>,
}

impl<T: Send + 'static> ScheduledTask<T> {
    fn create(ctx: Arc<SchedCtx>, fut: FutureTask<T>, sched: SchedState) -> Arc<Self> {
        let task = Arc::new(Self {
            fut,
            sched,
            ctx,
            outer: OnceLock::new(),
        });
        let _ = task.outer.set(Arc::downgrade(&task));
        task
    }

    fn outer_task(&self) -> Option<Task> {
        Some(self.outer.get()?.upgrade()? as Task)
    }

    /// Remaining delay until the next trigger; zero once ripe.
    pub fn delay(&self) -> Duration {
        self.sched.delay()
    }

    pub fn is_periodic(&self) -> bool {
        self.sched.is_periodic()
    }

    pub fn is_done(&self) -> bool {
        self.fut.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.fut.is_cancelled()
    }

    /// Cancels the future; with remove-on-cancel set, also unlinks the task
    /// from the delay heap immediately.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let cancelled = self.fut.cancel(may_interrupt);
        if cancelled && self.ctx.remove_on_cancel.load(Ordering::Relaxed) && self.sched.heap_index() >= 0
        {
            if let Some(task) = self.outer_task() {
                self.ctx.queue.remove(&task);
            }
        }
        cancelled
    }

    pub fn get(&self) -> Result<T, JoinError>
    where
        T: Clone,
    {
        self.fut.get()
    }

    pub fn get_timeout(&self, timeout: Duration) -> Result<T, JoinError>
    where
        T: Clone,
    {
        self.fut.get_timeout(timeout)
    }

    /// Orders two scheduled tasks by `(trigger, sequence)`, consistent with
    /// their remaining delays.
    pub fn schedule_cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sched.key().cmp(&other.sched.key())
    }
}

impl<T: Send + 'static> Job for ScheduledTask<T> {
    fn run(&self) {
        let periodic = self.sched.is_periodic();
        if !self.ctx.can_run(periodic, self.sched.delay_nanos()) {
            self.cancel(false);
        } else if !periodic {
            self.fut.run();
        } else if self.fut.run_and_reset() {
            self.sched.advance();
            if let Some(task) = self.outer_task() {
                self.ctx.re_execute_periodic(task);
            }
        }
    }

    fn sched(&self) -> Option<&SchedState> {
        Some(&self.sched)
    }

    fn cancel(&self, may_interrupt: bool) -> bool {
        ScheduledTask::cancel(self, may_interrupt)
    }

    fn is_cancelled(&self) -> bool {
        ScheduledTask::is_cancelled(self)
    }
}

struct SchedHooks {
    ctx: Arc<SchedCtx>,
}

impl PoolHooks for SchedHooks {
    /// Enforces the after-shutdown policies over a queue snapshot.
    fn on_shutdown(&self) {
        let keep_delayed = self.ctx.execute_delayed.load(Ordering::Relaxed);
        let keep_periodic = self.ctx.continue_periodic.load(Ordering::Relaxed);
        for task in self.ctx.queue.snapshot() {
            let Some(sched) = task.sched() else { continue };
            let evict = if sched.is_periodic() {
                !keep_periodic
            } else {
                !keep_delayed && sched.delay_nanos() > 0
            };
            if (evict || task.is_cancelled()) && self.ctx.queue.remove(&task) {
                task.cancel(false);
            }
        }
    }
}

/// Worker pool executing tasks after a delay, optionally periodically.
pub struct ScheduledPool {
    pool: ThreadPool,
    ctx: Arc<SchedCtx>,
}

impl ScheduledPool {
    /// # Panics
    /// Panics if `core_size == 0` (a scheduled pool with no core workers
    /// could leave ripe tasks with no thread to run them).
    pub fn new(core_size: usize) -> Self {
        Self::with_parts(core_size, Arc::new(DefaultThreadFactory), RejectionPolicy::Abort)
    }

    pub fn with_parts(
        core_size: usize,
        factory: Arc<dyn ThreadFactory>,
        policy: RejectionPolicy,
    ) -> Self {
        assert!(core_size > 0, "core_size must be > 0");
        let queue = Arc::new(DelayQueue::new());
        let ctx = Arc::new(SchedCtx {
            queue: Arc::clone(&queue),
            pool: OnceLock::new(),
            seq: AtomicU64::new(0),
            continue_periodic: AtomicBool::new(false),
            execute_delayed: AtomicBool::new(true),
            remove_on_cancel: AtomicBool::new(false),
        });
        let mut config = PoolConfig::new(core_size, usize::MAX);
        config.keep_alive = DEFAULT_KEEP_ALIVE;
        config.policy = policy;
        let pool = ThreadPool::with_parts(
            config,
            queue as Arc<dyn WorkQueue>,
            factory,
            Arc::new(SchedHooks {
                ctx: Arc::clone(&ctx),
            }),
        );
        let _ = ctx.pool.set(Arc::downgrade(pool.inner()));
        Self { pool, ctx }
    }

    fn trigger_at(&self, delay: Duration) -> u64 {
        now_nanos().saturating_add(delay.as_nanos() as u64)
    }

    fn next_seq(&self) -> u64 {
        self.ctx.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn delayed_execute<T: Send + 'static>(
        &self,
        task: Arc<ScheduledTask<T>>,
    ) -> Result<(), RejectedError> {
        let inner = self.pool.inner();
        if inner.is_shutdown() {
            return pool::reject(inner, task as Task);
        }
        let queued: Task = task.clone();
        let _ = self.ctx.queue.offer(queued.clone());
        let periodic = task.sched.is_periodic();
        if !self.ctx.can_run(periodic, task.sched.delay_nanos()) && self.ctx.queue.remove(&queued) {
            task.fut.cancel(false);
        } else {
            pool::ensure_prestart(inner);
        }
        Ok(())
    }

    /// Runs `f` once after `delay`; zero (or effectively negative) delay
    /// fires immediately.
    pub fn schedule<T, F>(
        &self,
        f: F,
        delay: Duration,
    ) -> Result<Arc<ScheduledTask<T>>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let sched = SchedState::new(self.next_seq(), self.trigger_at(delay), 0);
        let task = ScheduledTask::create(Arc::clone(&self.ctx), FutureTask::new(f), sched);
        self.delayed_execute(Arc::clone(&task))?;
        Ok(task)
    }

    /// Runs `f` every `period`, measured trigger-to-trigger, starting after
    /// `initial_delay`. Runs never overlap.
    ///
    /// # Panics
    /// Panics if `period` is zero.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        f: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<Arc<ScheduledTask<()>>, RejectedError>
    where
        F: FnMut() + Send + 'static,
    {
        assert!(period > Duration::ZERO, "period must be > 0");
        self.schedule_periodic(f, initial_delay, period.as_nanos() as i64)
    }

    /// Runs `f` repeatedly with `delay` between one completion and the next
    /// trigger, starting after `initial_delay`.
    ///
    /// # Panics
    /// Panics if `delay` is zero.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        f: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<Arc<ScheduledTask<()>>, RejectedError>
    where
        F: FnMut() + Send + 'static,
    {
        assert!(delay > Duration::ZERO, "delay must be > 0");
        self.schedule_periodic(f, initial_delay, -(delay.as_nanos() as i64))
    }

    fn schedule_periodic<F>(
        &self,
        mut f: F,
        initial_delay: Duration,
        period_nanos: i64,
    ) -> Result<Arc<ScheduledTask<()>>, RejectedError>
    where
        F: FnMut() + Send + 'static,
    {
        let sched = SchedState::new(self.next_seq(), self.trigger_at(initial_delay), period_nanos);
        let fut = FutureTask::from_fn_mut(move || f());
        let task = ScheduledTask::create(Arc::clone(&self.ctx), fut, sched);
        self.delayed_execute(Arc::clone(&task))?;
        Ok(task)
    }

    /// Immediate execution, expressed as a zero-delay schedule.
    pub fn execute_now(&self, f: impl FnOnce() + Send + 'static) -> Result<(), RejectedError> {
        self.schedule(f, Duration::ZERO).map(|_| ())
    }

    /// Zero-delay submission returning the future.
    pub fn submit<T, F>(&self, f: F) -> Result<Arc<ScheduledTask<T>>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.schedule(f, Duration::ZERO)
    }

    pub fn continue_periodic_after_shutdown(&self) -> bool {
        self.ctx.continue_periodic.load(Ordering::Relaxed)
    }

    pub fn set_continue_periodic_after_shutdown(&self, value: bool) {
        self.ctx.continue_periodic.store(value, Ordering::Relaxed);
        if !value && self.pool.is_shutdown() {
            self.pool.inner().hooks.on_shutdown();
        }
    }

    pub fn execute_delayed_after_shutdown(&self) -> bool {
        self.ctx.execute_delayed.load(Ordering::Relaxed)
    }

    pub fn set_execute_delayed_after_shutdown(&self, value: bool) {
        self.ctx.execute_delayed.store(value, Ordering::Relaxed);
        if !value && self.pool.is_shutdown() {
            self.pool.inner().hooks.on_shutdown();
        }
    }

    pub fn remove_on_cancel(&self) -> bool {
        self.ctx.remove_on_cancel.load(Ordering::Relaxed)
    }

    pub fn set_remove_on_cancel(&self, value: bool) {
        self.ctx.remove_on_cancel.store(value, Ordering::Relaxed);
    }

    /// Tasks currently waiting in the delay queue.
    pub fn queued_len(&self) -> usize {
        self.ctx.queue.len()
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    pub fn shutdown_now(&self) -> Vec<Task> {
        self.pool.shutdown_now()
    }

    pub fn is_shutdown(&self) -> bool {
        self.pool.is_shutdown()
    }

    pub fn is_terminated(&self) -> bool {
        self.pool.is_terminated()
    }

    pub fn await_termination(&self, timeout: Duration) -> Result<bool, Interrupted> {
        self.pool.await_termination(timeout)
    }

    /// The worker pool underneath, for status queries and tuning.
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }
}
