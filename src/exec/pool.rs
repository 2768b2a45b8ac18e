//! OS-thread worker pool.
//!
//! # Lifecycle
//! One packed atomic word ([`super::ctl`]) carries run-state and worker
//! count; both are always updated together by CAS, so `add_worker` can
//! reserve a slot atomically against shutdown and `try_terminate` can
//! observe "no workers, nothing queued" as one consistent snapshot. The
//! run-state only ever advances:
//!
//! ```text
//! RUNNING -> SHUTDOWN -> TIDYING -> TERMINATED
//!         -> STOP     ->
//! ```
//!
//! # Dispatch
//! `execute` starts a core worker with the task as its first job while under
//! the core size; past that it enqueues, re-checking the run-state after the
//! enqueue (rolling back and rejecting if the pool shut down underneath);
//! when the queue refuses, it starts a non-core worker up to the maximum,
//! and rejects through the configured policy when that fails too.
//!
//! # Workers
//! A worker owns one thread and a private lock whose only purpose is to
//! separate "idle in queue wait" (unlocked) from "running a task" (locked):
//! `shutdown` interrupts exactly the workers it can try-lock, so in-flight
//! tasks are never disturbed before STOP. `get_task` folds queue polling,
//! keep-alive timeout eligibility and the shutdown protocol into one loop;
//! returning `None` retires the worker after it has already given up its
//! slot in the control word.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::interrupt::{self, InterruptToken, WaitOutcome};

use super::completion::CompletionQueue;
use super::ctl;
use super::error::{Interrupted, InvokeError, JoinError, RejectedError};
use super::queue::{SyncQueue, WorkQueue};
use super::task::{job_fn, panic_message, FutureTask, Task};

static POOL_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Saturation / shutdown handling for refused tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionPolicy {
    /// Surface [`RejectedError`] to the submitter.
    Abort,
    /// Run the task on the submitting thread, unless shut down.
    CallerRuns,
    /// Drop the task silently.
    Discard,
    /// Drop the oldest queued task and retry, unless shut down.
    DiscardOldest,
}

/// Pool sizing and policy knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers kept alive without timeout (unless `allow_core_timeout`).
    pub core_size: usize,
    /// Hard ceiling on workers.
    pub max_size: usize,
    /// Idle time after which a timeout-eligible worker retires.
    pub keep_alive: Duration,
    /// Extend the keep-alive timeout to core workers.
    pub allow_core_timeout: bool,
    pub policy: RejectionPolicy,
}

impl PoolConfig {
    pub fn new(core_size: usize, max_size: usize) -> Self {
        Self {
            core_size,
            max_size,
            keep_alive: Duration::ZERO,
            allow_core_timeout: false,
            policy: RejectionPolicy::Abort,
        }
    }

    /// # Panics
    /// Panics on an inconsistent configuration.
    pub fn validate(&self) {
        assert!(self.max_size > 0, "max_size must be > 0");
        assert!(
            self.max_size >= self.core_size,
            "max_size must be >= core_size"
        );
        if self.allow_core_timeout {
            assert!(
                self.keep_alive > Duration::ZERO,
                "core timeout requires keep_alive > 0"
            );
        }
    }
}

/// Creates the threads workers run on.
pub trait ThreadFactory: Send + Sync {
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send + 'static>) -> std::io::Result<()>;
}

/// Named threads via the standard builder.
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send + 'static>) -> std::io::Result<()> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map(|_| ())
    }
}

/// Extension points around task execution and pool termination.
///
/// A panicking hook is fatal to the worker that called it; the pool replaces
/// the worker if sizing policy requires one.
pub trait PoolHooks: Send + Sync {
    fn before_execute(&self, task: &Task) {
        let _ = task;
    }

    fn after_execute(&self, task: &Task, panic: Option<&str>) {
        let _ = (task, panic);
    }

    /// Runs once, inside the TIDYING -> TERMINATED transition.
    fn terminated(&self) {}

    /// Runs once per `shutdown` call, after the state advance.
    fn on_shutdown(&self) {}
}

/// No-op hook set.
pub struct DefaultHooks;

impl PoolHooks for DefaultHooks {}

pub(crate) struct Worker {
    id: usize,
    first_task: Mutex<Option<Task>>,
    completed: AtomicU64,
    /// Held while running a task; `try_lock` failing means "busy".
    run_lock: Mutex<()>,
    /// Set by the worker thread once it is running.
    started: OnceLock<Arc<InterruptToken>>,
}

impl Worker {
    fn interrupt_if_started(&self) {
        if let Some(token) = self.started.get() {
            token.interrupt();
        }
    }

    fn is_busy(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }
}

struct PoolMain {
    workers: HashMap<usize, Arc<Worker>>,
    largest_pool_size: usize,
    completed_task_count: u64,
    next_worker_id: usize,
}

pub(crate) struct PoolInner {
    pub(crate) ctl: CachePadded<AtomicI32>,
    pub(crate) queue: Arc<dyn WorkQueue>,
    main: Mutex<PoolMain>,
    termination: Condvar,
    factory: Arc<dyn ThreadFactory>,
    pub(crate) hooks: Arc<dyn PoolHooks>,
    policy: RejectionPolicy,
    name: String,
    core_size: AtomicUsize,
    max_size: AtomicUsize,
    keep_alive_nanos: AtomicU64,
    allow_core_timeout: AtomicBool,
}

impl PoolInner {
    pub(crate) fn is_shutdown(&self) -> bool {
        ctl::run_state_at_least(self.ctl.load(Ordering::Acquire), ctl::SHUTDOWN)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        ctl::run_state_at_least(self.ctl.load(Ordering::Acquire), ctl::STOP)
    }
}

/// The worker pool.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub fn new(config: PoolConfig, queue: Arc<dyn WorkQueue>) -> Self {
        Self::with_parts(config, queue, Arc::new(DefaultThreadFactory), Arc::new(DefaultHooks))
    }

    pub fn with_parts(
        config: PoolConfig,
        queue: Arc<dyn WorkQueue>,
        factory: Arc<dyn ThreadFactory>,
        hooks: Arc<dyn PoolHooks>,
    ) -> Self {
        config.validate();
        let name = format!("pool-{}", POOL_SEQ.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(PoolInner {
                ctl: CachePadded::new(AtomicI32::new(ctl::ctl_of(ctl::RUNNING, 0))),
                queue,
                main: Mutex::new(PoolMain {
                    workers: HashMap::new(),
                    largest_pool_size: 0,
                    completed_task_count: 0,
                    next_worker_id: 0,
                }),
                termination: Condvar::new(),
                factory,
                hooks,
                policy: config.policy,
                name,
                core_size: AtomicUsize::new(config.core_size),
                max_size: AtomicUsize::new(config.max_size),
                keep_alive_nanos: AtomicU64::new(config.keep_alive.as_nanos() as u64),
                allow_core_timeout: AtomicBool::new(config.allow_core_timeout),
            }),
        }
    }

    /// Fixed-size pool over an unbounded FIFO queue.
    ///
    /// # Panics
    /// Panics if `workers == 0`.
    pub fn fixed(workers: usize) -> Self {
        assert!(workers > 0, "workers must be > 0");
        Self::new(
            PoolConfig::new(workers, workers),
            Arc::new(SyncQueue::unbounded()),
        )
    }

    /// Single-worker pool: tasks run one at a time, in order.
    pub fn single() -> Self {
        Self::fixed(1)
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Runs `task` some time in the future, on a worker or (by policy) on
    /// the calling thread.
    pub fn execute(&self, task: Task) -> Result<(), RejectedError> {
        execute_task(&self.inner, task)
    }

    /// Convenience: [`execute`](ThreadPool::execute) for a closure.
    pub fn execute_fn(&self, f: impl FnOnce() + Send + 'static) -> Result<(), RejectedError> {
        self.execute(job_fn(f))
    }

    /// Submits a value-returning closure; the future delivers the outcome.
    pub fn submit<T, F>(&self, f: F) -> Result<Arc<FutureTask<T>>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let fut = Arc::new(FutureTask::new(f));
        self.execute(Arc::clone(&fut) as Task)?;
        Ok(fut)
    }

    /// Submits a no-result closure whose future completes with `result`.
    pub fn submit_with<T, F>(&self, f: F, result: T) -> Result<Arc<FutureTask<T>>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.submit(move || {
            f();
            result
        })
    }

    /// Runs every task, returning the futures once all are done. Rejection
    /// or interruption cancels whatever was started.
    pub fn invoke_all<T, F>(&self, tasks: Vec<F>) -> Result<Vec<Arc<FutureTask<T>>>, InvokeError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let mut futures = Vec::with_capacity(tasks.len());
        let result = (|| {
            for f in tasks {
                let fut = Arc::new(FutureTask::new(f));
                futures.push(Arc::clone(&fut));
                execute_task(&self.inner, fut as Task).map_err(|_| InvokeError::Rejected)?;
            }
            for fut in &futures {
                if !fut.is_done() {
                    fut.wait_done().map_err(|_| InvokeError::Interrupted)?;
                }
            }
            Ok(())
        })();
        match result {
            Ok(()) => Ok(futures),
            Err(err) => {
                for fut in &futures {
                    fut.cancel(true);
                }
                Err(err)
            }
        }
    }

    /// As [`invoke_all`](ThreadPool::invoke_all) with a deadline; tasks
    /// still pending at the deadline are cancelled, and the futures are
    /// returned either way.
    pub fn invoke_all_timed<T, F>(
        &self,
        tasks: Vec<F>,
        timeout: Duration,
    ) -> Result<Vec<Arc<FutureTask<T>>>, InvokeError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let mut futures = Vec::with_capacity(tasks.len());
        let result = (|| {
            for f in tasks {
                let fut = Arc::new(FutureTask::new(f));
                futures.push(Arc::clone(&fut));
                execute_task(&self.inner, fut as Task).map_err(|_| InvokeError::Rejected)?;
            }
            for fut in &futures {
                if fut.is_done() {
                    continue;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(false);
                }
                match fut.wait_done_timed(remaining) {
                    Ok(true) => {}
                    Ok(false) => return Ok(false),
                    Err(Interrupted) => return Err(InvokeError::Interrupted),
                }
            }
            Ok(true)
        })();
        match result {
            Ok(completed) => {
                if !completed {
                    for fut in &futures {
                        fut.cancel(true);
                    }
                }
                Ok(futures)
            }
            Err(err) => {
                for fut in &futures {
                    fut.cancel(true);
                }
                Err(err)
            }
        }
    }

    /// Returns the first successful result, cancelling the rest. Tasks are
    /// fed in lazily: each completion admits the next submission, so a fast
    /// early result saves the later tasks entirely.
    ///
    /// # Panics
    /// Panics if `tasks` is empty.
    pub fn invoke_any<T, F>(&self, tasks: Vec<F>) -> Result<T, InvokeError>
    where
        T: Send + Clone + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.do_invoke_any(tasks, None)
    }

    /// Timed [`invoke_any`](ThreadPool::invoke_any).
    ///
    /// # Panics
    /// Panics if `tasks` is empty.
    pub fn invoke_any_timed<T, F>(&self, tasks: Vec<F>, timeout: Duration) -> Result<T, InvokeError>
    where
        T: Send + Clone + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.do_invoke_any(tasks, Some(Instant::now() + timeout))
    }

    fn do_invoke_any<T, F>(
        &self,
        tasks: Vec<F>,
        deadline: Option<Instant>,
    ) -> Result<T, InvokeError>
    where
        T: Send + Clone + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        assert!(!tasks.is_empty(), "invoke_any requires at least one task");
        let mut futures = Vec::with_capacity(tasks.len());
        let result = self.invoke_any_loop(tasks, deadline, &mut futures);
        for fut in &futures {
            fut.cancel(true);
        }
        result
    }

    fn invoke_any_loop<T, F>(
        &self,
        tasks: Vec<F>,
        deadline: Option<Instant>,
        futures: &mut Vec<Arc<FutureTask<T>>>,
    ) -> Result<T, InvokeError>
    where
        T: Send + Clone + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let cq = CompletionQueue::new();
        let mut iter = tasks.into_iter();
        let mut ntasks = iter.len();
        let mut active = 0usize;
        let mut last_err: Option<JoinError> = None;

        let first = iter.next().expect("tasks checked non-empty");
        submit_tracked(&self.inner, &cq, futures, first)?;
        ntasks -= 1;
        active += 1;

        loop {
            if let Some(fut) = cq.poll() {
                active -= 1;
                match fut.get() {
                    Ok(v) => return Ok(v),
                    Err(err) => last_err = Some(err),
                }
                continue;
            }
            if ntasks > 0 {
                if let Some(f) = iter.next() {
                    submit_tracked(&self.inner, &cq, futures, f)?;
                    ntasks -= 1;
                    active += 1;
                }
                continue;
            }
            if active == 0 {
                return Err(InvokeError::AllFailed(
                    last_err.take().unwrap_or(JoinError::Cancelled),
                ));
            }
            // Wait in slices so an interrupt is noticed promptly.
            let slice = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(InvokeError::TimedOut);
                    }
                    remaining.min(Duration::from_millis(50))
                }
                None => Duration::from_millis(50),
            };
            match cq.poll_timed(slice) {
                Some(fut) => {
                    active -= 1;
                    match fut.get() {
                        Ok(v) => return Ok(v),
                        Err(err) => last_err = Some(err),
                    }
                }
                None => {
                    if interrupt::interrupted() {
                        return Err(InvokeError::Interrupted);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stops accepting tasks; queued tasks still run. Idempotent.
    pub fn shutdown(&self) {
        {
            let main = self.inner.main.lock().unwrap();
            ctl::advance_run_state(&self.inner.ctl, ctl::SHUTDOWN);
            interrupt_idle_workers_locked(&main, false);
        }
        log::debug!("{}: shutdown", self.inner.name);
        self.inner.hooks.on_shutdown();
        try_terminate(&self.inner);
    }

    /// Stops accepting and processing; interrupts every started worker and
    /// returns the tasks that never ran.
    pub fn shutdown_now(&self) -> Vec<Task> {
        let tasks;
        let workers: Vec<Arc<Worker>>;
        {
            let main = self.inner.main.lock().unwrap();
            ctl::advance_run_state(&self.inner.ctl, ctl::STOP);
            workers = main.workers.values().cloned().collect();
            tasks = self.inner.queue.drain();
        }
        // Interrupt outside the main lock: a worker's wake path may need it.
        for worker in &workers {
            worker.interrupt_if_started();
        }
        log::debug!(
            "{}: shutdown_now, {} tasks drained",
            self.inner.name,
            tasks.len()
        );
        try_terminate(&self.inner);
        tasks
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    /// Shut down but not yet terminated.
    pub fn is_terminating(&self) -> bool {
        let c = self.inner.ctl.load(Ordering::Acquire);
        ctl::run_state_at_least(c, ctl::SHUTDOWN) && ctl::run_state_less_than(c, ctl::TERMINATED)
    }

    pub fn is_terminated(&self) -> bool {
        ctl::run_state_at_least(self.inner.ctl.load(Ordering::Acquire), ctl::TERMINATED)
    }

    /// Blocks until terminated or the timeout elapses.
    pub fn await_termination(&self, timeout: Duration) -> Result<bool, Interrupted> {
        let deadline = Instant::now() + timeout;
        let waker: Arc<dyn Fn() + Send + Sync> = {
            let inner = Arc::clone(&self.inner);
            Arc::new(move || {
                let _guard = inner.main.lock().unwrap();
                inner.termination.notify_all();
            })
        };
        let mut main = self.inner.main.lock().unwrap();
        loop {
            if self.is_terminated() {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let (guard, outcome) = interrupt::wait_interruptible(
                &self.inner.termination,
                main,
                Some(remaining),
                &waker,
            );
            main = guard;
            if outcome == WaitOutcome::Interrupted {
                interrupt::interrupted();
                return Err(Interrupted);
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection and tuning
    // ------------------------------------------------------------------

    pub fn pool_size(&self) -> usize {
        let main = self.inner.main.lock().unwrap();
        if ctl::run_state_at_least(self.inner.ctl.load(Ordering::Acquire), ctl::TIDYING) {
            0
        } else {
            main.workers.len()
        }
    }

    /// Workers currently running a task.
    pub fn active_count(&self) -> usize {
        let main = self.inner.main.lock().unwrap();
        main.workers.values().filter(|w| w.is_busy()).count()
    }

    pub fn largest_pool_size(&self) -> usize {
        self.inner.main.lock().unwrap().largest_pool_size
    }

    pub fn completed_task_count(&self) -> u64 {
        let main = self.inner.main.lock().unwrap();
        let mut n = main.completed_task_count;
        for w in main.workers.values() {
            n += w.completed.load(Ordering::Relaxed);
        }
        n
    }

    /// Approximate total of tasks ever accepted: completed, running and
    /// queued.
    pub fn task_count(&self) -> u64 {
        let main = self.inner.main.lock().unwrap();
        let mut n = main.completed_task_count;
        for w in main.workers.values() {
            n += w.completed.load(Ordering::Relaxed);
            if w.is_busy() {
                n += 1;
            }
        }
        n + self.inner.queue.len() as u64
    }

    pub fn core_size(&self) -> usize {
        self.inner.core_size.load(Ordering::Relaxed)
    }

    /// Re-sizes the core. Excess idle workers retire; a grown core starts
    /// workers for already-queued tasks.
    ///
    /// # Panics
    /// Panics if the new size exceeds the maximum.
    pub fn set_core_size(&self, core_size: usize) {
        assert!(
            self.inner.max_size.load(Ordering::Relaxed) >= core_size,
            "core_size must be <= max_size"
        );
        let old = self.inner.core_size.swap(core_size, Ordering::Relaxed);
        let wc = ctl::worker_count_of(self.inner.ctl.load(Ordering::Acquire));
        if wc > core_size {
            interrupt_idle_workers(&self.inner, false);
        } else if core_size > old {
            let mut spare = (core_size - old).min(self.inner.queue.len());
            while spare > 0 && add_worker(&self.inner, None, true) {
                spare -= 1;
                if self.inner.queue.is_empty() {
                    break;
                }
            }
        }
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size.load(Ordering::Relaxed)
    }

    /// # Panics
    /// Panics if `max_size == 0` or below the core size.
    pub fn set_max_size(&self, max_size: usize) {
        assert!(max_size > 0, "max_size must be > 0");
        assert!(
            max_size >= self.inner.core_size.load(Ordering::Relaxed),
            "max_size must be >= core_size"
        );
        self.inner.max_size.store(max_size, Ordering::Relaxed);
        if ctl::worker_count_of(self.inner.ctl.load(Ordering::Acquire)) > max_size {
            interrupt_idle_workers(&self.inner, false);
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_nanos(self.inner.keep_alive_nanos.load(Ordering::Relaxed))
    }

    /// # Panics
    /// Panics when zeroing the keep-alive while core timeout is allowed.
    pub fn set_keep_alive(&self, keep_alive: Duration) {
        if keep_alive.is_zero() {
            assert!(
                !self.inner.allow_core_timeout.load(Ordering::Relaxed),
                "core timeout requires keep_alive > 0"
            );
        }
        let nanos = keep_alive.as_nanos() as u64;
        let old = self.inner.keep_alive_nanos.swap(nanos, Ordering::Relaxed);
        if nanos < old {
            interrupt_idle_workers(&self.inner, false);
        }
    }

    pub fn allows_core_timeout(&self) -> bool {
        self.inner.allow_core_timeout.load(Ordering::Relaxed)
    }

    /// # Panics
    /// Panics when enabling with a zero keep-alive.
    pub fn set_allow_core_timeout(&self, value: bool) {
        if value {
            assert!(
                self.inner.keep_alive_nanos.load(Ordering::Relaxed) > 0,
                "core timeout requires keep_alive > 0"
            );
        }
        if self.inner.allow_core_timeout.swap(value, Ordering::Relaxed) != value && value {
            interrupt_idle_workers(&self.inner, false);
        }
    }

    /// Starts one idle core worker ahead of demand.
    pub fn prestart_core(&self) -> bool {
        ctl::worker_count_of(self.inner.ctl.load(Ordering::Acquire))
            < self.inner.core_size.load(Ordering::Relaxed)
            && add_worker(&self.inner, None, true)
    }

    /// Starts all core workers; returns how many were started.
    pub fn prestart_all_core(&self) -> usize {
        let mut n = 0;
        while add_worker(&self.inner, None, true) {
            n += 1;
        }
        n
    }

    /// Removes a queued task by identity.
    pub fn remove(&self, task: &Task) -> bool {
        let removed = self.inner.queue.remove(task);
        try_terminate(&self.inner);
        removed
    }

    /// Drops cancelled futures still sitting in the queue.
    pub fn purge(&self) {
        for task in self.inner.queue.snapshot() {
            if task.is_cancelled() {
                self.inner.queue.remove(&task);
            }
        }
        try_terminate(&self.inner);
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }
}

fn submit_tracked<T, F>(
    pool: &Arc<PoolInner>,
    cq: &CompletionQueue<T>,
    futures: &mut Vec<Arc<FutureTask<T>>>,
    f: F,
) -> Result<(), InvokeError>
where
    T: Send + Clone + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let fut = Arc::new(FutureTask::new(f));
    cq.track(&fut);
    futures.push(Arc::clone(&fut));
    execute_task(pool, fut as Task).map_err(|_| InvokeError::Rejected)
}

pub(crate) fn execute_task(pool: &Arc<PoolInner>, task: Task) -> Result<(), RejectedError> {
    let mut c = pool.ctl.load(Ordering::Acquire);
    if ctl::worker_count_of(c) < pool.core_size.load(Ordering::Relaxed) {
        if add_worker(pool, Some(task.clone()), true) {
            return Ok(());
        }
        c = pool.ctl.load(Ordering::Acquire);
    }
    if ctl::is_running(c) {
        if let Err(task) = pool.queue.offer(task.clone()) {
            // Queue saturated: grow toward the maximum.
            if !add_worker(pool, Some(task.clone()), false) {
                return reject(pool, task);
            }
            return Ok(());
        }
        // Enqueued; the pool may have shut down or drained underneath.
        let recheck = pool.ctl.load(Ordering::Acquire);
        if !ctl::is_running(recheck) && pool.queue.remove(&task) {
            reject(pool, task)
        } else {
            if ctl::worker_count_of(recheck) == 0 {
                add_worker(pool, None, false);
            }
            Ok(())
        }
    } else if !add_worker(pool, Some(task.clone()), false) {
        reject(pool, task)
    } else {
        Ok(())
    }
}

pub(crate) fn reject(pool: &Arc<PoolInner>, task: Task) -> Result<(), RejectedError> {
    match pool.policy {
        RejectionPolicy::Abort => Err(RejectedError),
        RejectionPolicy::CallerRuns => {
            if !pool.is_shutdown() {
                task.run();
            }
            Ok(())
        }
        RejectionPolicy::Discard => Ok(()),
        RejectionPolicy::DiscardOldest => {
            if !pool.is_shutdown() {
                pool.queue.poll();
                execute_task(pool, task)
            } else {
                Ok(())
            }
        }
    }
}

/// Reserves a count slot, registers and starts a worker. Any failure after
/// the successful CAS rolls the reservation back; the rollback can only run
/// on that path, so the count never goes negative.
fn add_worker(pool: &Arc<PoolInner>, first_task: Option<Task>, core: bool) -> bool {
    let mut c = pool.ctl.load(Ordering::Acquire);
    'retry: loop {
        if ctl::run_state_at_least(c, ctl::SHUTDOWN)
            && (ctl::run_state_at_least(c, ctl::STOP)
                || first_task.is_some()
                || pool.queue.is_empty())
        {
            return false;
        }
        loop {
            let bound = if core {
                pool.core_size.load(Ordering::Relaxed)
            } else {
                pool.max_size.load(Ordering::Relaxed)
            };
            if ctl::worker_count_of(c) >= bound.min(ctl::COUNT_MASK as usize) {
                return false;
            }
            if ctl::try_increment_worker_count(&pool.ctl, c) {
                break 'retry;
            }
            c = pool.ctl.load(Ordering::Acquire);
            if ctl::run_state_at_least(c, ctl::SHUTDOWN) {
                continue 'retry;
            }
        }
    }

    let mut worker_added = false;
    let mut worker_started = false;
    let (id, worker) = {
        let mut main = pool.main.lock().unwrap();
        let id = main.next_worker_id;
        main.next_worker_id += 1;
        let worker = Arc::new(Worker {
            id,
            first_task: Mutex::new(first_task),
            completed: AtomicU64::new(0),
            run_lock: Mutex::new(()),
            started: OnceLock::new(),
        });
        let c = pool.ctl.load(Ordering::Acquire);
        if ctl::is_running(c)
            || (ctl::run_state_less_than(c, ctl::STOP)
                && worker.first_task.lock().unwrap().is_none())
        {
            main.workers.insert(id, Arc::clone(&worker));
            worker_added = true;
            let size = main.workers.len();
            if size > main.largest_pool_size {
                main.largest_pool_size = size;
            }
        }
        (id, worker)
    };
    if worker_added {
        let pool2 = Arc::clone(pool);
        let w2 = Arc::clone(&worker);
        let name = format!("{}-worker-{}", pool.name, id);
        match pool.factory.spawn(&name, Box::new(move || worker_main(pool2, w2))) {
            Ok(()) => {
                log::trace!("{name} started");
                worker_started = true;
            }
            Err(err) => log::error!("{name} failed to start: {err}"),
        }
    }
    if !worker_started {
        add_worker_failed(pool, id);
    }
    worker_started
}

/// Guarantees at least one worker is alive to service the queue, even with
/// a zero core size.
pub(crate) fn ensure_prestart(pool: &Arc<PoolInner>) {
    let wc = ctl::worker_count_of(pool.ctl.load(Ordering::Acquire));
    if wc < pool.core_size.load(Ordering::Relaxed) {
        add_worker(pool, None, true);
    } else if wc == 0 {
        add_worker(pool, None, false);
    }
}

fn add_worker_failed(pool: &Arc<PoolInner>, id: usize) {
    {
        let mut main = pool.main.lock().unwrap();
        main.workers.remove(&id);
        ctl::decrement_worker_count(&pool.ctl);
    }
    try_terminate(pool);
}

fn worker_main(pool: Arc<PoolInner>, worker: Arc<Worker>) {
    let _ = worker.started.set(interrupt::current());
    run_worker(&pool, &worker);
}

fn run_worker(pool: &Arc<PoolInner>, w: &Arc<Worker>) {
    let token = interrupt::current();
    let mut task = w.first_task.lock().unwrap().take();
    let mut completed_abruptly = true;
    loop {
        let current = match task.take() {
            Some(t) => t,
            None => match get_task(pool) {
                Some(t) => t,
                None => {
                    completed_abruptly = false;
                    break;
                }
            },
        };
        let busy = match w.run_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // A stopping pool keeps its workers interrupted; a running pool
        // clears any stale flag so it cannot leak into the task. The second
        // STOP check closes the race with a shutdown_now between the clear
        // and the run.
        let c = pool.ctl.load(Ordering::Acquire);
        if (ctl::run_state_at_least(c, ctl::STOP)
            || (token.take_interrupted()
                && ctl::run_state_at_least(pool.ctl.load(Ordering::Acquire), ctl::STOP)))
            && !token.is_interrupted()
        {
            token.interrupt();
        }
        let before = catch_unwind(AssertUnwindSafe(|| pool.hooks.before_execute(&current)));
        if before.is_err() {
            w.completed.fetch_add(1, Ordering::Relaxed);
            drop(busy);
            break;
        }
        let ran = catch_unwind(AssertUnwindSafe(|| current.run()));
        let after = match &ran {
            Ok(()) => catch_unwind(AssertUnwindSafe(|| pool.hooks.after_execute(&current, None))),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                catch_unwind(AssertUnwindSafe(|| {
                    pool.hooks.after_execute(&current, Some(&msg))
                }))
            }
        };
        w.completed.fetch_add(1, Ordering::Relaxed);
        drop(busy);
        if let Err(payload) = &ran {
            log::error!(
                "{}-worker-{}: task panicked: {}",
                pool.name,
                w.id,
                panic_message(payload.as_ref())
            );
            break;
        }
        if after.is_err() {
            break;
        }
    }
    process_worker_exit(pool, w, completed_abruptly);
}

/// Queue polling, timeout eligibility and the shutdown protocol in one loop.
/// Returning `None` means the worker retires; its count slot is already
/// released.
fn get_task(pool: &Arc<PoolInner>) -> Option<Task> {
    let mut timed_out = false;
    loop {
        let c = pool.ctl.load(Ordering::Acquire);
        if ctl::run_state_at_least(c, ctl::SHUTDOWN)
            && (ctl::run_state_at_least(c, ctl::STOP) || pool.queue.is_empty())
        {
            ctl::decrement_worker_count(&pool.ctl);
            return None;
        }
        let wc = ctl::worker_count_of(c);
        let timed = pool.allow_core_timeout.load(Ordering::Relaxed)
            || wc > pool.core_size.load(Ordering::Relaxed);
        if (wc > pool.max_size.load(Ordering::Relaxed) || (timed && timed_out))
            && (wc > 1 || pool.queue.is_empty())
        {
            if ctl::try_decrement_worker_count(&pool.ctl, c) {
                return None;
            }
            continue;
        }
        let polled = if timed {
            pool.queue
                .poll_timed(Duration::from_nanos(pool.keep_alive_nanos.load(Ordering::Relaxed)))
        } else {
            pool.queue.take().map(Some)
        };
        match polled {
            Ok(Some(task)) => return Some(task),
            Ok(None) => timed_out = true,
            Err(Interrupted) => timed_out = false,
        }
    }
}

fn process_worker_exit(pool: &Arc<PoolInner>, w: &Arc<Worker>, completed_abruptly: bool) {
    if completed_abruptly {
        // Normal exits gave the slot back in get_task.
        ctl::decrement_worker_count(&pool.ctl);
    }
    {
        let mut main = pool.main.lock().unwrap();
        main.completed_task_count += w.completed.load(Ordering::Relaxed);
        main.workers.remove(&w.id);
    }
    try_terminate(pool);
    let c = pool.ctl.load(Ordering::Acquire);
    if ctl::run_state_less_than(c, ctl::STOP) {
        if !completed_abruptly {
            let mut min = if pool.allow_core_timeout.load(Ordering::Relaxed) {
                0
            } else {
                pool.core_size.load(Ordering::Relaxed)
            };
            if min == 0 && !pool.queue.is_empty() {
                min = 1;
            }
            if ctl::worker_count_of(c) >= min {
                return;
            }
        }
        add_worker(pool, None, false);
    }
}

/// Transitions through TIDYING to TERMINATED once nothing is left to do;
/// otherwise nudges one idle worker so the shutdown signal propagates.
pub(crate) fn try_terminate(pool: &Arc<PoolInner>) {
    loop {
        let c = pool.ctl.load(Ordering::Acquire);
        if ctl::is_running(c)
            || ctl::run_state_at_least(c, ctl::TIDYING)
            || (ctl::run_state_less_than(c, ctl::STOP) && !pool.queue.is_empty())
        {
            return;
        }
        if ctl::worker_count_of(c) != 0 {
            interrupt_idle_workers(pool, true);
            return;
        }
        let main = pool.main.lock().unwrap();
        if pool
            .ctl
            .compare_exchange(
                c,
                ctl::ctl_of(ctl::TIDYING, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let hook = catch_unwind(AssertUnwindSafe(|| pool.hooks.terminated()));
            if hook.is_err() {
                log::error!("{}: terminated hook panicked", pool.name);
            }
            pool.ctl
                .store(ctl::ctl_of(ctl::TERMINATED, 0), Ordering::Release);
            pool.termination.notify_all();
            log::debug!("{}: terminated", pool.name);
            return;
        }
        drop(main);
    }
}

fn interrupt_idle_workers(pool: &Arc<PoolInner>, only_one: bool) {
    let main = pool.main.lock().unwrap();
    interrupt_idle_workers_locked(&main, only_one);
}

fn interrupt_idle_workers_locked(main: &PoolMain, only_one: bool) {
    for worker in main.workers.values() {
        if let Some(token) = worker.started.get() {
            if !token.is_interrupted() {
                // Only an unlocked worker is idle; a busy one finishes its
                // task undisturbed.
                if let Ok(_idle) = worker.run_lock.try_lock() {
                    token.interrupt();
                }
            }
        }
        if only_one {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn drain_pool(pool: &ThreadPool) {
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn fixed_pool_runs_submitted_closures() {
        let pool = ThreadPool::fixed(2);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let h = Arc::clone(&hits);
            pool.execute_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        drain_pool(&pool);
        assert_eq!(hits.load(Ordering::SeqCst), 16);
        assert_eq!(pool.completed_task_count(), 16);
        assert!(pool.is_terminated());
    }

    #[test]
    fn submit_delivers_results() {
        let pool = ThreadPool::fixed(2);
        let fut = pool.submit(|| 6 * 7).unwrap();
        assert_eq!(fut.get().unwrap(), 42);
        let with = pool.submit_with(|| {}, "done").unwrap();
        assert_eq!(with.get().unwrap(), "done");
        drain_pool(&pool);
    }

    #[test]
    fn single_pool_preserves_order() {
        let pool = ThreadPool::single();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let s = Arc::clone(&seen);
            pool.execute_fn(move || s.lock().unwrap().push(i)).unwrap();
        }
        drain_pool(&pool);
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_rejects_new_tasks_but_drains_queue() {
        let pool = ThreadPool::fixed(1);
        let gate = Arc::new(Mutex::new(()));
        let hits = Arc::new(AtomicUsize::new(0));
        let held = gate.lock().unwrap();
        {
            let g = Arc::clone(&gate);
            pool.execute_fn(move || {
                drop(g.lock().unwrap());
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        for _ in 0..3 {
            let h = Arc::clone(&hits);
            pool.execute_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(pool.execute_fn(|| {}).is_err());
        drop(held);
        assert!(pool.await_termination(Duration::from_secs(5)).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn double_shutdown_is_idempotent() {
        let pool = ThreadPool::fixed(1);
        pool.execute_fn(|| {}).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn shutdown_now_returns_unexecuted_tasks() {
        let pool = ThreadPool::fixed(1);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        {
            let g = Arc::clone(&gate);
            pool.execute_fn(move || {
                drop(g.lock().unwrap());
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        let never_ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let n = Arc::clone(&never_ran);
            pool.execute_fn(move || {
                n.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        let drained = pool.shutdown_now();
        assert_eq!(drained.len(), 4);
        drop(held);
        assert!(pool.await_termination(Duration::from_secs(5)).unwrap());
        assert_eq!(never_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn abort_policy_rejects_when_saturated() {
        let pool = ThreadPool::new(
            PoolConfig::new(1, 1),
            Arc::new(SyncQueue::bounded(1)),
        );
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        {
            let g = Arc::clone(&gate);
            pool.execute_fn(move || {
                drop(g.lock().unwrap());
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        pool.execute_fn(|| {}).unwrap(); // fills the queue
        assert_eq!(pool.execute_fn(|| {}).unwrap_err(), RejectedError);
        drop(held);
        drain_pool(&pool);
    }

    #[test]
    fn caller_runs_policy_executes_inline() {
        let mut config = PoolConfig::new(1, 1);
        config.policy = RejectionPolicy::CallerRuns;
        let pool = ThreadPool::new(config, Arc::new(SyncQueue::bounded(1)));
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        {
            let g = Arc::clone(&gate);
            pool.execute_fn(move || {
                drop(g.lock().unwrap());
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        pool.execute_fn(|| {}).unwrap();
        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        {
            let r = Arc::clone(&ran_on);
            pool.execute_fn(move || {
                *r.lock().unwrap() = Some(thread::current().id());
            })
            .unwrap();
        }
        assert_eq!(*ran_on.lock().unwrap(), Some(caller));
        drop(held);
        drain_pool(&pool);
    }

    #[test]
    fn discard_oldest_policy_replaces_queue_head() {
        let mut config = PoolConfig::new(1, 1);
        config.policy = RejectionPolicy::DiscardOldest;
        let pool = ThreadPool::new(config, Arc::new(SyncQueue::bounded(1)));
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        {
            let g = Arc::clone(&gate);
            pool.execute_fn(move || {
                drop(g.lock().unwrap());
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        let old = Arc::new(AtomicUsize::new(0));
        let new = Arc::new(AtomicUsize::new(0));
        {
            let o = Arc::clone(&old);
            pool.execute_fn(move || {
                o.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        {
            let n = Arc::clone(&new);
            pool.execute_fn(move || {
                n.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        drop(held);
        drain_pool(&pool);
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_core_workers_grow_to_max_and_retire() {
        let mut config = PoolConfig::new(0, 3);
        config.keep_alive = Duration::from_millis(50);
        let pool = ThreadPool::new(config, Arc::new(SyncQueue::bounded(1)));
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        for _ in 0..3 {
            let g = Arc::clone(&gate);
            pool.execute_fn(move || {
                drop(g.lock().unwrap());
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        assert!(pool.pool_size() >= 2);
        drop(held);
        thread::sleep(Duration::from_millis(400));
        // Past keep-alive, the non-core workers are gone.
        assert_eq!(pool.pool_size(), 0);
        drain_pool(&pool);
    }

    #[test]
    fn panicking_task_does_not_kill_the_pool() {
        let pool = ThreadPool::fixed(1);
        pool.execute_fn(|| panic!("task failure")).unwrap();
        thread::sleep(Duration::from_millis(50));
        let fut = pool.submit(|| 5).unwrap();
        assert_eq!(fut.get().unwrap(), 5);
        drain_pool(&pool);
    }

    #[test]
    fn hooks_see_every_task() {
        struct Counting {
            before: AtomicUsize,
            after: AtomicUsize,
            terminated: AtomicUsize,
        }
        impl PoolHooks for Counting {
            fn before_execute(&self, _task: &Task) {
                self.before.fetch_add(1, Ordering::SeqCst);
            }
            fn after_execute(&self, _task: &Task, _panic: Option<&str>) {
                self.after.fetch_add(1, Ordering::SeqCst);
            }
            fn terminated(&self) {
                self.terminated.fetch_add(1, Ordering::SeqCst);
            }
        }
        let hooks = Arc::new(Counting {
            before: AtomicUsize::new(0),
            after: AtomicUsize::new(0),
            terminated: AtomicUsize::new(0),
        });
        let pool = ThreadPool::with_parts(
            PoolConfig::new(1, 1),
            Arc::new(SyncQueue::unbounded()),
            Arc::new(DefaultThreadFactory),
            Arc::clone(&hooks) as Arc<dyn PoolHooks>,
        );
        for _ in 0..5 {
            pool.execute_fn(|| {}).unwrap();
        }
        drain_pool(&pool);
        assert_eq!(hooks.before.load(Ordering::SeqCst), 5);
        assert_eq!(hooks.after.load(Ordering::SeqCst), 5);
        assert_eq!(hooks.terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invoke_all_waits_for_everything() {
        let pool = ThreadPool::fixed(3);
        let tasks: Vec<_> = (0..6)
            .map(|i| {
                move || {
                    thread::sleep(Duration::from_millis(10));
                    i * 2
                }
            })
            .collect();
        let futures = pool.invoke_all(tasks).unwrap();
        let results: Vec<i32> = futures.iter().map(|f| f.get().unwrap()).collect();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10]);
        drain_pool(&pool);
    }

    #[test]
    fn invoke_all_timed_cancels_stragglers() {
        let pool = ThreadPool::fixed(1);
        let tasks: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![
            Box::new(|| 1),
            Box::new(|| {
                thread::sleep(Duration::from_secs(5));
                2
            }),
            Box::new(|| 3),
        ];
        let futures = pool
            .invoke_all_timed(
                tasks.into_iter().map(|b| move || b()).collect(),
                Duration::from_millis(200),
            )
            .unwrap();
        assert_eq!(futures[0].get().unwrap(), 1);
        assert!(futures[2].is_cancelled() || futures[2].is_done());
        pool.shutdown_now();
    }

    #[test]
    fn invoke_any_returns_first_success() {
        let pool = ThreadPool::fixed(2);
        let tasks: Vec<Box<dyn FnOnce() -> &'static str + Send>> = vec![
            Box::new(|| panic!("first fails")),
            Box::new(|| "winner"),
            Box::new(|| {
                thread::sleep(Duration::from_secs(3));
                "slow"
            }),
        ];
        let got = pool
            .invoke_any(tasks.into_iter().map(|b| move || b()).collect())
            .unwrap();
        assert_eq!(got, "winner");
        pool.shutdown_now();
    }

    #[test]
    fn invoke_any_reports_total_failure() {
        let pool = ThreadPool::fixed(2);
        let tasks: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![
            Box::new(|| panic!("a")),
            Box::new(|| panic!("b")),
        ];
        let err = pool
            .invoke_any(tasks.into_iter().map(|b| move || b()).collect())
            .unwrap_err();
        assert!(matches!(err, InvokeError::AllFailed(JoinError::Panicked(_))));
        drain_pool(&pool);
    }

    #[test]
    fn await_termination_times_out_while_running() {
        let pool = ThreadPool::fixed(1);
        assert!(!pool.await_termination(Duration::from_millis(30)).unwrap());
        drain_pool(&pool);
    }

    #[test]
    fn worker_counts_are_reported() {
        let pool = ThreadPool::fixed(2);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        for _ in 0..2 {
            let g = Arc::clone(&gate);
            pool.execute_fn(move || {
                drop(g.lock().unwrap());
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.pool_size(), 2);
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.largest_pool_size(), 2);
        drop(held);
        drain_pool(&pool);
        assert_eq!(pool.pool_size(), 0);
    }

    #[test]
    fn prestart_spins_up_core_workers() {
        let pool = ThreadPool::fixed(3);
        assert!(pool.prestart_core());
        assert_eq!(pool.prestart_all_core(), 2);
        assert!(!pool.prestart_core());
        thread::sleep(Duration::from_millis(30));
        assert_eq!(pool.pool_size(), 3);
        drain_pool(&pool);
    }

    #[test]
    fn remove_pulls_a_queued_task() {
        let pool = ThreadPool::fixed(1);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        {
            let g = Arc::clone(&gate);
            pool.execute_fn(move || {
                drop(g.lock().unwrap());
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        let dropped = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&dropped);
        let task = job_fn(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
        pool.execute(task.clone()).unwrap();
        assert!(pool.remove(&task));
        drop(held);
        drain_pool(&pool);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }
}
