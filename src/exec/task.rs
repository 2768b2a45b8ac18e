//! Tasks and futures.
//!
//! [`FutureTask`] is a one-shot (or, for periodic use, resettable) unit of
//! work whose lifecycle is a tagged state:
//!
//! ```text
//! NEW -> COMPLETING -> NORMAL
//! NEW -> COMPLETING -> EXCEPTIONAL
//! NEW -> CANCELLED
//! NEW -> INTERRUPTING -> INTERRUPTED
//! ```
//!
//! Every terminal state is `>= CANCELLED` or published after the outcome
//! slot is written, so observing a state above `COMPLETING` makes the
//! outcome safe to read. Transitions into the terminal region are one-shot
//! CAS operations; nothing ever moves backwards.
//!
//! # Waiter stack
//! Threads blocked in `get` park on a Treiber stack: push is a CAS on the
//! head, completion detaches the whole chain with a single swap and unparks
//! every recorded thread. A waiter that leaves early (timeout, interrupt)
//! tombstones its node's thread slot and prunes dead nodes in one traversal,
//! restarting under contention. Nodes are reclaimed through epoch-based
//! deferral, and only ever by the thread that pushed them, so a concurrent
//! traversal never touches freed memory.
//!
//! # Interrupt delivery
//! `cancel(true)` interrupts the recorded runner and only then publishes
//! `INTERRUPTED`. A runner observing `INTERRUPTING` after its body returns
//! spin-yields until the publisher finishes, so the interrupt is always
//! delivered inside this task and cannot leak into the next one.

use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crossbeam_epoch::{self as epoch, Atomic, Shared};

use crate::interrupt::{self, InterruptToken};

use super::delay::SchedState;
use super::error::{Interrupted, JoinError};

/// A runnable unit owned by a pool queue.
///
/// `cancel`/`is_cancelled` are surfaced here so queue maintenance (shutdown
/// policies, purge) can act on futures without knowing their result type;
/// plain jobs report not-cancellable.
pub trait Job: Send + Sync {
    fn run(&self);

    /// Scheduling metadata, for jobs owned by a delay queue.
    fn sched(&self) -> Option<&SchedState> {
        None
    }

    fn cancel(&self, may_interrupt: bool) -> bool {
        let _ = may_interrupt;
        false
    }

    fn is_cancelled(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").finish()
    }
}

/// Shared handle to a queued job.
pub type Task = Arc<dyn Job>;

/// Wraps a closure as a [`Task`] with no observable result.
pub fn job_fn(f: impl FnOnce() + Send + 'static) -> Task {
    Arc::new(ClosureJob {
        body: Mutex::new(Some(Box::new(f))),
    })
}

struct ClosureJob {
    body: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Job for ClosureJob {
    fn run(&self) {
        let body = self.body.lock().unwrap().take();
        if let Some(f) = body {
            f();
        }
    }
}

const NEW: u8 = 0;
const COMPLETING: u8 = 1;
const NORMAL: u8 = 2;
const EXCEPTIONAL: u8 = 3;
const CANCELLED: u8 = 4;
const INTERRUPTING: u8 = 5;
const INTERRUPTED: u8 = 6;

enum Outcome<T> {
    Value(T),
    Panic(Arc<str>),
}

struct WaitNode {
    /// `None` once the waiter left or was woken; dead nodes are pruned.
    thread: Mutex<Option<Thread>>,
    next: Atomic<WaitNode>,
}

/// A cancellable computation with a retrievable outcome.
pub struct FutureTask<T> {
    state: AtomicU8,
    /// The work body; cleared on completion (and between periodic runs only
    /// while executing).
    body: Mutex<Option<Box<dyn FnMut() -> T + Send>>>,
    /// Written exactly once, before the terminal state is published.
    outcome: UnsafeCell<Option<Outcome<T>>>,
    /// Interrupt token of the thread currently running the body.
    runner: Mutex<Option<Arc<InterruptToken>>>,
    /// Treiber stack of parked getters.
    waiters: Atomic<WaitNode>,
    /// Invoked once on entering a terminal state, before waiters wake.
    done_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

unsafe impl<T: Send> Send for FutureTask<T> {}
unsafe impl<T: Send> Sync for FutureTask<T> {}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

impl<T: Send + 'static> FutureTask<T> {
    /// One-shot task from a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let mut f = Some(f);
        Self::from_fn_mut(move || {
            let f = f.take().expect("one-shot task body invoked twice");
            f()
        })
    }

    /// Re-runnable task body, for periodic execution via
    /// [`run_and_reset`](FutureTask::run_and_reset).
    pub fn from_fn_mut<F>(f: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self {
            state: AtomicU8::new(NEW),
            body: Mutex::new(Some(Box::new(f))),
            outcome: UnsafeCell::new(None),
            runner: Mutex::new(None),
            waiters: Atomic::null(),
            done_hook: Mutex::new(None),
        }
    }

    /// Registers the hook run once when the task reaches a terminal state,
    /// before waiters are woken. A hook set after completion never runs.
    pub fn set_done_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.done_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) >= CANCELLED
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) != NEW
    }

    /// Attempts `NEW -> CANCELLED` (or `NEW -> INTERRUPTING -> INTERRUPTED`
    /// with `may_interrupt`). Returns false once the task left `NEW`.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let target = if may_interrupt { INTERRUPTING } else { CANCELLED };
        if self
            .state
            .compare_exchange(NEW, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if may_interrupt {
            if let Some(runner) = self.runner.lock().unwrap().as_ref() {
                runner.interrupt();
            }
            self.state.store(INTERRUPTED, Ordering::Release);
        }
        self.finish_completion();
        true
    }

    /// Runs the body to completion, publishing the outcome.
    pub fn run(&self) {
        if self.state.load(Ordering::Acquire) != NEW {
            return;
        }
        {
            let mut runner = self.runner.lock().unwrap();
            if runner.is_some() {
                return;
            }
            *runner = Some(interrupt::current());
        }
        if self.state.load(Ordering::Acquire) == NEW {
            let body = self.body.lock().unwrap().take();
            if let Some(mut body) = body {
                match catch_unwind(AssertUnwindSafe(|| body())) {
                    Ok(value) => self.set(value),
                    Err(payload) => self.set_panic(payload),
                }
            }
        }
        *self.runner.lock().unwrap() = None;
        let s = self.state.load(Ordering::Acquire);
        if s >= INTERRUPTING {
            self.handle_cancel_interrupt(s);
        }
    }

    /// Runs the body without completing the future, restoring it to `NEW`
    /// eligibility. Returns true only if the body ran and the state is still
    /// `NEW` (no cancel or failure slipped in).
    pub fn run_and_reset(&self) -> bool {
        if self.state.load(Ordering::Acquire) != NEW {
            return false;
        }
        {
            let mut runner = self.runner.lock().unwrap();
            if runner.is_some() {
                return false;
            }
            *runner = Some(interrupt::current());
        }
        let mut ran = false;
        if self.state.load(Ordering::Acquire) == NEW {
            let body = self.body.lock().unwrap().take();
            if let Some(mut body) = body {
                match catch_unwind(AssertUnwindSafe(|| {
                    let _ = body();
                })) {
                    Ok(()) => {
                        ran = true;
                        *self.body.lock().unwrap() = Some(body);
                    }
                    Err(payload) => self.set_panic(payload),
                }
            }
        }
        *self.runner.lock().unwrap() = None;
        let s = self.state.load(Ordering::Acquire);
        if s >= INTERRUPTING {
            self.handle_cancel_interrupt(s);
        }
        ran && s == NEW
    }

    /// Blocks until a terminal state and delivers the outcome.
    pub fn get(&self) -> Result<T, JoinError>
    where
        T: Clone,
    {
        let mut s = self.state.load(Ordering::Acquire);
        if s <= COMPLETING {
            s = self.await_done(None).map_err(|_| JoinError::Interrupted)?;
        }
        self.report(s)
    }

    /// As [`get`](FutureTask::get), bounded by `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, JoinError>
    where
        T: Clone,
    {
        let mut s = self.state.load(Ordering::Acquire);
        if s <= COMPLETING {
            s = self
                .await_done(Some(timeout))
                .map_err(|_| JoinError::Interrupted)?;
            if s <= COMPLETING {
                return Err(JoinError::TimedOut);
            }
        }
        self.report(s)
    }

    /// Blocks until a terminal state without reading the outcome.
    pub fn wait_done(&self) -> Result<(), Interrupted> {
        if self.state.load(Ordering::Acquire) <= COMPLETING {
            self.await_done(None)?;
        }
        Ok(())
    }

    /// Timed variant; `Ok(false)` means the task is still pending.
    pub fn wait_done_timed(&self, timeout: Duration) -> Result<bool, Interrupted> {
        let mut s = self.state.load(Ordering::Acquire);
        if s <= COMPLETING {
            s = self.await_done(Some(timeout))?;
        }
        Ok(s > COMPLETING)
    }

    fn report(&self, s: u8) -> Result<T, JoinError>
    where
        T: Clone,
    {
        match s {
            NORMAL => {
                // SAFETY: a state above COMPLETING is published with Release
                // after the outcome write; our Acquire load pairs with it.
                match unsafe { &*self.outcome.get() } {
                    Some(Outcome::Value(v)) => Ok(v.clone()),
                    _ => unreachable!("NORMAL published without an outcome"),
                }
            }
            EXCEPTIONAL => match unsafe { &*self.outcome.get() } {
                Some(Outcome::Panic(msg)) => Err(JoinError::Panicked(Arc::clone(msg))),
                _ => unreachable!("EXCEPTIONAL published without a cause"),
            },
            _ => Err(JoinError::Cancelled),
        }
    }

    fn set(&self, value: T) {
        if self
            .state
            .compare_exchange(NEW, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            unsafe { *self.outcome.get() = Some(Outcome::Value(value)) };
            self.state.store(NORMAL, Ordering::Release);
            self.finish_completion();
        }
    }

    fn set_panic(&self, payload: Box<dyn Any + Send>) {
        if self
            .state
            .compare_exchange(NEW, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let msg = panic_message(payload.as_ref());
            unsafe { *self.outcome.get() = Some(Outcome::Panic(msg.into())) };
            self.state.store(EXCEPTIONAL, Ordering::Release);
            self.finish_completion();
        }
    }

    fn handle_cancel_interrupt(&self, s: u8) {
        if s == INTERRUPTING {
            while self.state.load(Ordering::Acquire) == INTERRUPTING {
                thread::yield_now();
            }
        }
    }

    /// Runs the done hook, detaches the waiter stack and wakes everyone.
    fn finish_completion(&self) {
        let hook = self.done_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let guard = epoch::pin();
        let mut q = self.waiters.swap(Shared::null(), Ordering::AcqRel, &guard);
        while let Some(node) = unsafe { q.as_ref() } {
            if let Some(t) = node.thread.lock().unwrap().take() {
                t.unpark();
            }
            q = node.next.load(Ordering::Acquire, &guard);
        }
        // Nodes are freed by the waiters that own them.
        *self.body.lock().unwrap() = None;
    }

    /// Parks until the state passes COMPLETING, the deadline expires, or the
    /// thread is interrupted (consuming the flag).
    fn await_done(&self, timeout: Option<Duration>) -> Result<u8, Interrupted> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut node: *mut WaitNode = std::ptr::null_mut();
        let mut queued = false;
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s > COMPLETING {
                self.leave_wait(node, queued);
                return Ok(s);
            }
            if s == COMPLETING {
                // The outcome write is in flight; parking would outlast it.
                thread::yield_now();
                continue;
            }
            if interrupt::interrupted() {
                self.leave_wait(node, queued);
                return Err(Interrupted);
            }
            if node.is_null() {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        return Ok(s);
                    }
                }
                node = Box::into_raw(Box::new(WaitNode {
                    thread: Mutex::new(Some(thread::current())),
                    next: Atomic::null(),
                }));
                continue;
            }
            if !queued {
                let guard = epoch::pin();
                let head = self.waiters.load(Ordering::Acquire, &guard);
                unsafe { (*node).next.store(head, Ordering::Relaxed) };
                queued = self
                    .waiters
                    .compare_exchange(
                        head,
                        Shared::from(node as *const WaitNode),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        &guard,
                    )
                    .is_ok();
                continue;
            }
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        let s = self.state.load(Ordering::Acquire);
                        self.leave_wait(node, queued);
                        return Ok(s);
                    }
                    if self.state.load(Ordering::Acquire) < COMPLETING {
                        thread::park_timeout(d - now);
                    }
                }
                None => thread::park(),
            }
        }
    }

    /// Tombstones and reclaims this thread's wait node on any exit path.
    fn leave_wait(&self, node: *mut WaitNode, queued: bool) {
        if node.is_null() {
            return;
        }
        unsafe {
            (*node).thread.lock().unwrap().take();
            if queued {
                self.remove_waiter();
                let guard = epoch::pin();
                guard.defer_destroy(Shared::from(node as *const WaitNode));
            } else {
                drop(Box::from_raw(node));
            }
        }
    }

    /// Prunes dead nodes from the stack. Internal unlinks skip the CAS; a
    /// racing mutation is detected by re-checking the predecessor and the
    /// traversal restarts.
    fn remove_waiter(&self) {
        let guard = epoch::pin();
        'retry: loop {
            let mut pred: Shared<'_, WaitNode> = Shared::null();
            let mut q = self.waiters.load(Ordering::Acquire, &guard);
            while let Some(q_ref) = unsafe { q.as_ref() } {
                let next = q_ref.next.load(Ordering::Acquire, &guard);
                let live = q_ref.thread.lock().unwrap().is_some();
                if live {
                    pred = q;
                } else if let Some(p_ref) = unsafe { pred.as_ref() } {
                    p_ref.next.store(next, Ordering::Release);
                    if p_ref.thread.lock().unwrap().is_none() {
                        continue 'retry;
                    }
                } else if self
                    .waiters
                    .compare_exchange(q, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                    .is_err()
                {
                    continue 'retry;
                }
                q = next;
            }
            break;
        }
    }
}

impl<T: Send + 'static> Job for FutureTask<T> {
    fn run(&self) {
        FutureTask::run(self);
    }

    fn cancel(&self, may_interrupt: bool) -> bool {
        FutureTask::cancel(self, may_interrupt)
    }

    fn is_cancelled(&self) -> bool {
        FutureTask::is_cancelled(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_publishes_the_value() {
        let fut = FutureTask::new(|| 7);
        assert!(!fut.is_done());
        fut.run();
        assert!(fut.is_done());
        assert!(!fut.is_cancelled());
        assert_eq!(fut.get().unwrap(), 7);
        assert_eq!(fut.get().unwrap(), 7);
    }

    #[test]
    fn panic_becomes_exceptional_outcome() {
        let fut: FutureTask<u32> = FutureTask::new(|| panic!("boom"));
        fut.run();
        match fut.get().unwrap_err() {
            JoinError::Panicked(msg) => assert_eq!(&*msg, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn cancel_before_run_sticks() {
        let fut = FutureTask::new(|| 1);
        assert!(fut.cancel(false));
        assert!(!fut.cancel(false));
        assert!(fut.is_cancelled());
        fut.run();
        assert_eq!(fut.get().unwrap_err(), JoinError::Cancelled);
    }

    #[test]
    fn cancel_after_completion_fails() {
        let fut = FutureTask::new(|| 1);
        fut.run();
        assert!(!fut.cancel(true));
        assert_eq!(fut.get().unwrap(), 1);
    }

    #[test]
    fn get_blocks_until_another_thread_runs() {
        let fut = Arc::new(FutureTask::new(|| 99));
        let f2 = Arc::clone(&fut);
        let getter = thread::spawn(move || f2.get());
        thread::sleep(Duration::from_millis(30));
        fut.run();
        assert_eq!(getter.join().unwrap().unwrap(), 99);
    }

    #[test]
    fn many_getters_all_observe_the_outcome() {
        let fut = Arc::new(FutureTask::new(|| 5));
        let getters: Vec<_> = (0..8)
            .map(|_| {
                let f = Arc::clone(&fut);
                thread::spawn(move || f.get())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        fut.run();
        for g in getters {
            assert_eq!(g.join().unwrap().unwrap(), 5);
        }
    }

    #[test]
    fn timed_get_times_out_on_pending_task() {
        let fut = FutureTask::new(|| 1);
        assert_eq!(
            fut.get_timeout(Duration::from_millis(40)).unwrap_err(),
            JoinError::TimedOut
        );
        // Still runnable afterwards.
        fut.run();
        assert_eq!(fut.get().unwrap(), 1);
    }

    #[test]
    fn cancel_true_interrupts_the_runner() {
        let observed = Arc::new(AtomicUsize::new(0));
        let obs = Arc::clone(&observed);
        let fut = Arc::new(FutureTask::new(move || {
            let token = interrupt::current();
            for _ in 0..200 {
                if token.is_interrupted() {
                    obs.store(1, Ordering::SeqCst);
                    return 0u32;
                }
                thread::sleep(Duration::from_millis(1));
            }
            2
        }));
        let f2 = Arc::clone(&fut);
        let runner = thread::spawn(move || f2.run());
        thread::sleep(Duration::from_millis(20));
        assert!(fut.cancel(true));
        assert!(fut.is_cancelled());
        runner.join().unwrap();
        assert_eq!(fut.get().unwrap_err(), JoinError::Cancelled);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn interrupted_getter_leaves_cleanly() {
        let fut = Arc::new(FutureTask::new(|| 3));
        let f2 = Arc::clone(&fut);
        let (tx, rx) = std::sync::mpsc::channel();
        let getter = thread::spawn(move || {
            tx.send(interrupt::current()).unwrap();
            f2.get()
        });
        let token = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(30));
        token.interrupt();
        assert_eq!(getter.join().unwrap().unwrap_err(), JoinError::Interrupted);
        // The future is untouched; it can still run and complete.
        fut.run();
        assert_eq!(fut.get().unwrap(), 3);
    }

    #[test]
    fn run_and_reset_keeps_the_task_reusable() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let fut = FutureTask::from_fn_mut(move || c.fetch_add(1, Ordering::SeqCst));
        assert!(fut.run_and_reset());
        assert!(fut.run_and_reset());
        assert!(!fut.is_done());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        fut.run();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(fut.is_done());
    }

    #[test]
    fn run_and_reset_fails_after_cancel() {
        let fut = FutureTask::from_fn_mut(|| ());
        fut.cancel(false);
        assert!(!fut.run_and_reset());
    }

    #[test]
    fn done_hook_runs_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let fut = FutureTask::new(|| 1);
        fut.set_done_hook(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        fut.run();
        fut.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn done_hook_runs_on_cancel_too() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let fut = FutureTask::new(|| 1);
        fut.set_done_hook(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        fut.cancel(false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminal_state_is_stable_under_racing_cancel_and_run() {
        for _ in 0..50 {
            let fut = Arc::new(FutureTask::new(|| 1u32));
            let f1 = Arc::clone(&fut);
            let f2 = Arc::clone(&fut);
            let a = thread::spawn(move || f1.run());
            let b = thread::spawn(move || f2.cancel(false));
            a.join().unwrap();
            let cancelled = b.join().unwrap();
            // Exactly one of {NORMAL, CANCELLED} was published.
            match fut.get() {
                Ok(1) => assert!(!cancelled),
                Err(JoinError::Cancelled) => assert!(cancelled),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }

    #[test]
    fn closure_job_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let job = job_fn(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        job.run();
        job.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!job.is_cancelled());
        assert!(!job.cancel(false));
    }
}
