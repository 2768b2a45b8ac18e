//! Completion-order delivery of submitted futures.
//!
//! A [`CompletionQueue`] decouples producing tasks from consuming results:
//! futures submitted through it land on an internal channel the moment they
//! reach a terminal state (via the future's done hook, which fires before
//! waiters wake), so consumers receive them in completion order rather than
//! submission order. `get` on a future taken from the queue never blocks.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use super::error::RejectedError;
use super::pool::ThreadPool;
use super::task::{FutureTask, Task};

/// Hands back futures as they complete.
pub struct CompletionQueue<T> {
    tx: Sender<Arc<FutureTask<T>>>,
    rx: Receiver<Arc<FutureTask<T>>>,
}

impl<T: Send + 'static> CompletionQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Submits `f` to `pool`; its future will surface here once terminal
    /// (completed, failed or cancelled).
    pub fn submit<F>(&self, pool: &ThreadPool, f: F) -> Result<Arc<FutureTask<T>>, RejectedError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let fut = Arc::new(FutureTask::new(f));
        self.track(&fut);
        pool.execute(Arc::clone(&fut) as Task)?;
        Ok(fut)
    }

    /// Registers an already-built future for completion-order delivery.
    /// Must be called before the future can complete.
    pub fn track(&self, fut: &Arc<FutureTask<T>>) {
        let tx = self.tx.clone();
        let done = Arc::clone(fut);
        fut.set_done_hook(move || {
            let _ = tx.send(done);
        });
    }

    /// Next completed future, if one is already waiting.
    pub fn poll(&self) -> Option<Arc<FutureTask<T>>> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `timeout` for the next completed future.
    pub fn poll_timed(&self, timeout: Duration) -> Option<Arc<FutureTask<T>>> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Blocks for the next completed future.
    pub fn take(&self) -> Arc<FutureTask<T>> {
        self.rx
            .recv()
            .expect("completion channel outlives the queue")
    }
}

impl<T: Send + 'static> Default for CompletionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn results_arrive_in_completion_order() {
        let pool = ThreadPool::fixed(3);
        let cq = CompletionQueue::new();
        for (id, delay_ms) in [(1u32, 90u64), (2, 10), (3, 50)] {
            cq.submit(&pool, move || {
                thread::sleep(Duration::from_millis(delay_ms));
                id
            })
            .unwrap();
        }
        let order: Vec<u32> = (0..3).map(|_| cq.take().get().unwrap()).collect();
        assert_eq!(order, vec![2, 3, 1]);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn poll_is_empty_until_something_completes() {
        let pool = ThreadPool::fixed(1);
        let cq = CompletionQueue::new();
        assert!(cq.poll().is_none());
        cq.submit(&pool, || "done").unwrap();
        let fut = cq
            .poll_timed(Duration::from_secs(5))
            .expect("task completes well within the timeout");
        assert_eq!(fut.get().unwrap(), "done");
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn cancelled_futures_surface_too() {
        let pool = ThreadPool::fixed(1);
        let cq = CompletionQueue::new();
        let gate = Arc::new(std::sync::Mutex::new(()));
        let held = gate.lock().unwrap();
        {
            let g = Arc::clone(&gate);
            cq.submit(&pool, move || {
                drop(g.lock().unwrap());
                0u32
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        let queued = cq.submit(&pool, || 1u32).unwrap();
        queued.cancel(false);
        let first = cq.take();
        assert!(first.is_cancelled());
        drop(held);
        let second = cq.take();
        assert_eq!(second.get().unwrap(), 0);
        pool.shutdown_now();
    }

    #[test]
    fn poll_timed_respects_the_deadline() {
        let cq: CompletionQueue<u32> = CompletionQueue::new();
        let start = Instant::now();
        assert!(cq.poll_timed(Duration::from_millis(40)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
