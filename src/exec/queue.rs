//! Work queues feeding pool workers.
//!
//! The pool treats its queue as an external collaborator that is thread-safe
//! on its own; [`WorkQueue`] is that seam. `poll` returning `None` does not
//! imply the queue is empty — a delay queue legitimately returns `None` for
//! elements whose time has not come — so emptiness checks go through
//! `is_empty`. `take` and `poll_timed` consume the thread's interrupt flag
//! when they report [`Interrupted`].

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::interrupt::{self, WaitOutcome};

use super::error::Interrupted;
use super::task::Task;

/// Thread-safe task queue contract.
pub trait WorkQueue: Send + Sync {
    /// Non-blocking insert; a bounded queue hands the task back when full.
    fn offer(&self, task: Task) -> Result<(), Task>;

    /// Blocks until a task is ready.
    fn take(&self) -> Result<Task, Interrupted>;

    /// Blocks up to `timeout` for a ready task.
    fn poll_timed(&self, timeout: Duration) -> Result<Option<Task>, Interrupted>;

    /// Non-blocking: a task that is ready right now, if any.
    fn poll(&self) -> Option<Task>;

    /// Removes a specific queued task by identity.
    fn remove(&self, task: &Task) -> bool;

    /// Empties the queue, returning everything that was pending.
    fn drain(&self) -> Vec<Task>;

    /// A point-in-time copy of the queued tasks.
    fn snapshot(&self) -> Vec<Task>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SyncInner {
    items: Mutex<VecDeque<Task>>,
    available: Condvar,
}

/// FIFO [`WorkQueue`] over a mutex-guarded deque, optionally bounded.
pub struct SyncQueue {
    inner: Arc<SyncInner>,
    capacity: Option<usize>,
}

impl SyncQueue {
    pub fn unbounded() -> Self {
        Self {
            inner: Arc::new(SyncInner {
                items: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
            }),
            capacity: None,
        }
    }

    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be > 0");
        Self {
            inner: Arc::new(SyncInner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                available: Condvar::new(),
            }),
            capacity: Some(capacity),
        }
    }

    fn waker(&self) -> Arc<dyn Fn() + Send + Sync> {
        let inner = Arc::clone(&self.inner);
        Arc::new(move || {
            let _guard = inner.items.lock().unwrap();
            inner.available.notify_all();
        })
    }
}

impl WorkQueue for SyncQueue {
    fn offer(&self, task: Task) -> Result<(), Task> {
        let mut items = self.inner.items.lock().unwrap();
        if let Some(cap) = self.capacity {
            if items.len() >= cap {
                return Err(task);
            }
        }
        items.push_back(task);
        self.inner.available.notify_one();
        Ok(())
    }

    fn take(&self) -> Result<Task, Interrupted> {
        let waker = self.waker();
        let mut items = self.inner.items.lock().unwrap();
        loop {
            if let Some(task) = items.pop_front() {
                return Ok(task);
            }
            let (guard, outcome) =
                interrupt::wait_interruptible(&self.inner.available, items, None, &waker);
            items = guard;
            if outcome == WaitOutcome::Interrupted {
                interrupt::interrupted();
                return Err(Interrupted);
            }
        }
    }

    fn poll_timed(&self, timeout: Duration) -> Result<Option<Task>, Interrupted> {
        let waker = self.waker();
        let deadline = Instant::now() + timeout;
        let mut items = self.inner.items.lock().unwrap();
        loop {
            if let Some(task) = items.pop_front() {
                return Ok(Some(task));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let (guard, outcome) = interrupt::wait_interruptible(
                &self.inner.available,
                items,
                Some(remaining),
                &waker,
            );
            items = guard;
            if outcome == WaitOutcome::Interrupted {
                interrupt::interrupted();
                return Err(Interrupted);
            }
        }
    }

    fn poll(&self) -> Option<Task> {
        self.inner.items.lock().unwrap().pop_front()
    }

    fn remove(&self, task: &Task) -> bool {
        let mut items = self.inner.items.lock().unwrap();
        if let Some(i) = items.iter().position(|t| Arc::ptr_eq(t, task)) {
            items.remove(i);
            true
        } else {
            false
        }
    }

    fn drain(&self) -> Vec<Task> {
        self.inner.items.lock().unwrap().drain(..).collect()
    }

    fn snapshot(&self) -> Vec<Task> {
        self.inner.items.lock().unwrap().iter().cloned().collect()
    }

    fn len(&self) -> usize {
        self.inner.items.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::task::job_fn;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = SyncQueue::unbounded();
        let a = job_fn(|| {});
        let b = job_fn(|| {});
        q.offer(a.clone()).unwrap();
        q.offer(b.clone()).unwrap();
        assert!(Arc::ptr_eq(&q.poll().unwrap(), &a));
        assert!(Arc::ptr_eq(&q.poll().unwrap(), &b));
        assert!(q.poll().is_none());
    }

    #[test]
    fn bounded_queue_refuses_when_full() {
        let q = SyncQueue::bounded(1);
        q.offer(job_fn(|| {})).unwrap();
        let extra = job_fn(|| {});
        let back = q.offer(extra.clone()).unwrap_err();
        assert!(Arc::ptr_eq(&back, &extra));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn take_blocks_until_offer() {
        let q = Arc::new(SyncQueue::unbounded());
        let q2 = Arc::clone(&q);
        let taker = thread::spawn(move || q2.take());
        thread::sleep(Duration::from_millis(30));
        let t = job_fn(|| {});
        q.offer(t.clone()).unwrap();
        assert!(Arc::ptr_eq(&taker.join().unwrap().unwrap(), &t));
    }

    #[test]
    fn poll_timed_gives_up() {
        let q = SyncQueue::unbounded();
        let start = Instant::now();
        assert!(q.poll_timed(Duration::from_millis(40)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn interrupt_unblocks_take() {
        let q = Arc::new(SyncQueue::unbounded());
        let q2 = Arc::clone(&q);
        let (tx, rx) = std::sync::mpsc::channel();
        let taker = thread::spawn(move || {
            tx.send(interrupt::current()).unwrap();
            q2.take()
        });
        let token = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(30));
        token.interrupt();
        assert_eq!(taker.join().unwrap().unwrap_err(), Interrupted);
    }

    #[test]
    fn remove_by_identity() {
        let q = SyncQueue::unbounded();
        let a = job_fn(|| {});
        let b = job_fn(|| {});
        q.offer(a.clone()).unwrap();
        q.offer(b.clone()).unwrap();
        assert!(q.remove(&a));
        assert!(!q.remove(&a));
        assert_eq!(q.len(), 1);
        assert!(Arc::ptr_eq(&q.poll().unwrap(), &b));
    }

    #[test]
    fn drain_empties_in_order() {
        let q = SyncQueue::unbounded();
        let a = job_fn(|| {});
        let b = job_fn(|| {});
        q.offer(a.clone()).unwrap();
        q.offer(b.clone()).unwrap();
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert!(Arc::ptr_eq(&drained[0], &a));
        assert!(q.is_empty());
    }
}
