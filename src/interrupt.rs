//! Cooperative thread interruption.
//!
//! Threads have no preemptive interrupt; instead every blocking edge in this
//! crate checks a per-thread token. `interrupt()` sets the flag, invokes the
//! waker the blocked thread registered (condvar waits), and unparks the
//! thread (park-based waits). A blocking operation that reports interruption
//! consumes the flag, so the caller decides whether to retry or surface it.
//!
//! # No lost wakeups
//! A condvar waiter registers its waker and re-checks the flag *while holding
//! the structure's mutex*; the waker itself takes that mutex before
//! notifying. An interrupt that lands between the check and the wait
//! therefore blocks on the mutex until the waiter is actually waiting, and
//! the notification cannot be missed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, Thread};
use std::time::Duration;

/// Per-thread interruption state.
pub struct InterruptToken {
    flag: AtomicBool,
    thread: Thread,
    waker: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl InterruptToken {
    /// Sets the interrupt flag and wakes the thread from any blocking wait
    /// in this crate.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
        let waker = self.waker.lock().unwrap().clone();
        if let Some(w) = waker {
            w();
        }
        self.thread.unpark();
    }

    /// Reads the flag without clearing it.
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Reads and clears the flag.
    pub fn take_interrupted(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }

    /// Handle of the thread this token belongs to.
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    fn register_waker(&self, waker: Arc<dyn Fn() + Send + Sync>) {
        *self.waker.lock().unwrap() = Some(waker);
    }

    fn clear_waker(&self) {
        *self.waker.lock().unwrap() = None;
    }
}

thread_local! {
    static CURRENT: Arc<InterruptToken> = Arc::new(InterruptToken {
        flag: AtomicBool::new(false),
        thread: thread::current(),
        waker: Mutex::new(None),
    });
}

/// The calling thread's token.
pub fn current() -> Arc<InterruptToken> {
    CURRENT.with(Arc::clone)
}

/// Reads and clears the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    CURRENT.with(|t| t.take_interrupted())
}

/// Outcome of an interruptible condvar wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Notified or a spurious wake; re-check the predicate.
    Woken,
    /// The timeout elapsed.
    TimedOut,
    /// The thread was interrupted; the flag is still set.
    Interrupted,
}

/// Waits on `cond`, interruptibly, with an optional timeout.
///
/// `waker` must lock the mutex guarding `guard` and notify `cond`; it is
/// registered for the duration of the wait so `interrupt()` can reach a
/// blocked waiter. The guard is returned re-acquired in every case.
pub fn wait_interruptible<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Option<Duration>,
    waker: &Arc<dyn Fn() + Send + Sync>,
) -> (MutexGuard<'a, T>, WaitOutcome) {
    let token = current();
    token.register_waker(Arc::clone(waker));
    if token.is_interrupted() {
        token.clear_waker();
        return (guard, WaitOutcome::Interrupted);
    }
    let (guard, timed_out) = match timeout {
        Some(d) => {
            let (g, t) = cond.wait_timeout(guard, d).unwrap();
            (g, t.timed_out())
        }
        None => (cond.wait(guard).unwrap(), false),
    };
    token.clear_waker();
    if token.is_interrupted() {
        return (guard, WaitOutcome::Interrupted);
    }
    let outcome = if timed_out {
        WaitOutcome::TimedOut
    } else {
        WaitOutcome::Woken
    };
    (guard, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn take_clears_the_flag() {
        let token = current();
        token.interrupt();
        assert!(token.is_interrupted());
        assert!(interrupted());
        assert!(!interrupted());
    }

    #[test]
    fn interrupt_wakes_a_condvar_wait() {
        struct Shared {
            state: Mutex<u32>,
            cond: Condvar,
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(0),
            cond: Condvar::new(),
        });
        let woken = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = std::sync::mpsc::channel();
        let s2 = Arc::clone(&shared);
        let w2 = Arc::clone(&woken);
        let handle = thread::spawn(move || {
            tx.send(current()).unwrap();
            let waker: Arc<dyn Fn() + Send + Sync> = {
                let s = Arc::clone(&s2);
                Arc::new(move || {
                    let _g = s.state.lock().unwrap();
                    s.cond.notify_all();
                })
            };
            let guard = s2.state.lock().unwrap();
            let (_guard, outcome) =
                wait_interruptible(&s2.cond, guard, Some(Duration::from_secs(10)), &waker);
            if outcome == WaitOutcome::Interrupted {
                w2.store(1, Ordering::SeqCst);
            }
        });

        let token = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        token.interrupt();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pending_interrupt_short_circuits_the_wait() {
        let pair = Arc::new((Mutex::new(()), Condvar::new()));
        let p2 = Arc::clone(&pair);
        let waker: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let _g = p2.0.lock().unwrap();
            p2.1.notify_all();
        });
        current().interrupt();
        let guard = pair.0.lock().unwrap();
        let (_g, outcome) = wait_interruptible(&pair.1, guard, None, &waker);
        assert_eq!(outcome, WaitOutcome::Interrupted);
        assert!(interrupted());
    }
}
