//! Delay queue: a min-heap of scheduled jobs with a leader/follower wait.
//!
//! # Ordering
//! The heap orders by `(trigger, sequence)` — earliest trigger first, ties
//! broken by submission order — so the root is always the next job to fire.
//! Every queued job stores its own heap index, making removal by identity
//! O(log n) instead of a linear scan; an index of -1 means "not enqueued".
//!
//! # Leader/follower
//! In `take`, at most one thread (the leader) performs the timed wait
//! against the root's remaining delay; every other thread waits unbounded.
//! Inserting a new root clears the leader (its deadline is stale) and
//! signals one waiter; a departing thread signals a successor when a head
//! exists and no leader owns it. This keeps a pool of blocked workers from
//! all timing out against the same trigger.

use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::interrupt::{self, WaitOutcome};

use super::error::Interrupted;
use super::queue::WorkQueue;
use super::task::Task;

/// Nanoseconds on the crate's monotone clock.
pub(crate) fn now_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Scheduling metadata carried by jobs owned by a [`DelayQueue`].
pub struct SchedState {
    /// Tie-breaker: submission order.
    seq: u64,
    /// Absolute trigger time, nanoseconds on the monotone clock.
    trigger: AtomicU64,
    /// Positive: fixed-rate. Negative: fixed-delay. Zero: one-shot.
    period_nanos: i64,
    /// Position in the owning heap; -1 when not enqueued.
    heap_index: AtomicIsize,
}

impl SchedState {
    pub(crate) fn new(seq: u64, trigger: u64, period_nanos: i64) -> Self {
        Self {
            seq,
            trigger: AtomicU64::new(trigger),
            period_nanos,
            heap_index: AtomicIsize::new(-1),
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.period_nanos != 0
    }

    /// Remaining delay, zero once the trigger has passed.
    pub fn delay(&self) -> Duration {
        let d = self.delay_nanos();
        if d <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(d as u64)
        }
    }

    pub(crate) fn delay_nanos(&self) -> i64 {
        let trigger = self.trigger.load(Ordering::Acquire) as i128;
        let now = now_nanos() as i128;
        (trigger - now).clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub(crate) fn period_nanos(&self) -> i64 {
        self.period_nanos
    }

    /// Ordering key: `(trigger, sequence)`.
    pub(crate) fn key(&self) -> (u64, u64) {
        (self.trigger.load(Ordering::Acquire), self.seq)
    }

    /// Moves the trigger to the next period: fixed-rate advances from the
    /// previous trigger, fixed-delay from now.
    pub(crate) fn advance(&self) {
        let p = self.period_nanos;
        if p > 0 {
            self.trigger.fetch_add(p as u64, Ordering::AcqRel);
        } else {
            self.trigger
                .store(now_nanos().saturating_add((-p) as u64), Ordering::Release);
        }
    }

    pub(crate) fn heap_index(&self) -> isize {
        self.heap_index.load(Ordering::Acquire)
    }

    fn set_heap_index(&self, i: isize) {
        self.heap_index.store(i, Ordering::Release);
    }
}

fn sched(task: &Task) -> &SchedState {
    task.sched().expect("delay queue requires scheduled jobs")
}

fn set_index(task: &Task, i: isize) {
    sched(task).set_heap_index(i);
}

fn key(task: &Task) -> (u64, u64) {
    sched(task).key()
}

struct Heap {
    items: Vec<Task>,
    /// The one thread currently timing out against the root.
    leader: Option<ThreadId>,
}

fn sift_up(items: &mut [Task], mut k: usize) {
    let item = items[k].clone();
    while k > 0 {
        let parent = (k - 1) >> 1;
        if key(&item) >= key(&items[parent]) {
            break;
        }
        items[k] = items[parent].clone();
        set_index(&items[k], k as isize);
        k = parent;
    }
    items[k] = item;
    set_index(&items[k], k as isize);
}

fn sift_down(items: &mut [Task], mut k: usize) {
    let size = items.len();
    let item = items[k].clone();
    let half = size >> 1;
    while k < half {
        let mut child = (k << 1) + 1;
        let right = child + 1;
        if right < size && key(&items[right]) < key(&items[child]) {
            child = right;
        }
        if key(&item) <= key(&items[child]) {
            break;
        }
        items[k] = items[child].clone();
        set_index(&items[k], k as isize);
        k = child;
    }
    items[k] = item;
    set_index(&items[k], k as isize);
}

/// Pops the root; the hole is filled by the last element sifted down.
fn finish_poll(items: &mut Vec<Task>) -> Task {
    let first = items[0].clone();
    let last = items.pop().expect("finish_poll on empty heap");
    if !items.is_empty() {
        items[0] = last;
        sift_down(items, 0);
    }
    set_index(&first, -1);
    first
}

struct DelayInner {
    heap: Mutex<Heap>,
    available: Condvar,
}

/// Unbounded [`WorkQueue`] delivering jobs only once their trigger passes.
pub struct DelayQueue {
    inner: Arc<DelayInner>,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DelayInner {
                heap: Mutex::new(Heap {
                    items: Vec::with_capacity(16),
                    leader: None,
                }),
                available: Condvar::new(),
            }),
        }
    }

    fn waker(&self) -> Arc<dyn Fn() + Send + Sync> {
        let inner = Arc::clone(&self.inner);
        Arc::new(move || {
            let _guard = inner.heap.lock().unwrap();
            inner.available.notify_all();
        })
    }

    fn index_of(items: &[Task], task: &Task) -> Option<usize> {
        let i = sched(task).heap_index();
        if i >= 0 && (i as usize) < items.len() && Arc::ptr_eq(&items[i as usize], task) {
            Some(i as usize)
        } else {
            None
        }
    }
}

impl Default for DelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue for DelayQueue {
    fn offer(&self, task: Task) -> Result<(), Task> {
        let mut heap = self.inner.heap.lock().unwrap();
        let i = heap.items.len();
        heap.items.push(task.clone());
        if i == 0 {
            set_index(&heap.items[0], 0);
        } else {
            sift_up(&mut heap.items, i);
        }
        if Arc::ptr_eq(&heap.items[0], &task) {
            // New earliest trigger: any leader's deadline is stale.
            heap.leader = None;
            self.inner.available.notify_one();
        }
        Ok(())
    }

    fn take(&self) -> Result<Task, Interrupted> {
        let waker = self.waker();
        let me = thread::current().id();
        let mut heap = self.inner.heap.lock().unwrap();
        let result = loop {
            if heap.items.is_empty() {
                let (guard, outcome) =
                    interrupt::wait_interruptible(&self.inner.available, heap, None, &waker);
                heap = guard;
                if outcome == WaitOutcome::Interrupted {
                    break Err(Interrupted);
                }
                continue;
            }
            let delay = sched(&heap.items[0]).delay_nanos();
            if delay <= 0 {
                break Ok(finish_poll(&mut heap.items));
            }
            if heap.leader.is_some() {
                // Someone is already timing out against the root.
                let (guard, outcome) =
                    interrupt::wait_interruptible(&self.inner.available, heap, None, &waker);
                heap = guard;
                if outcome == WaitOutcome::Interrupted {
                    break Err(Interrupted);
                }
            } else {
                heap.leader = Some(me);
                let (guard, outcome) = interrupt::wait_interruptible(
                    &self.inner.available,
                    heap,
                    Some(Duration::from_nanos(delay as u64)),
                    &waker,
                );
                heap = guard;
                if heap.leader == Some(me) {
                    heap.leader = None;
                }
                if outcome == WaitOutcome::Interrupted {
                    break Err(Interrupted);
                }
            }
        };
        if heap.leader.is_none() && !heap.items.is_empty() {
            self.inner.available.notify_one();
        }
        drop(heap);
        if result.is_err() {
            interrupt::interrupted();
        }
        result
    }

    fn poll_timed(&self, timeout: Duration) -> Result<Option<Task>, Interrupted> {
        let waker = self.waker();
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut heap = self.inner.heap.lock().unwrap();
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if heap.items.is_empty() {
                if remaining.is_zero() {
                    break Ok(None);
                }
                let (guard, outcome) = interrupt::wait_interruptible(
                    &self.inner.available,
                    heap,
                    Some(remaining),
                    &waker,
                );
                heap = guard;
                if outcome == WaitOutcome::Interrupted {
                    break Err(Interrupted);
                }
                continue;
            }
            let delay = sched(&heap.items[0]).delay_nanos();
            if delay <= 0 {
                break Ok(Some(finish_poll(&mut heap.items)));
            }
            if remaining.is_zero() {
                break Ok(None);
            }
            let delay_dur = Duration::from_nanos(delay as u64);
            if remaining < delay_dur || heap.leader.is_some() {
                let (guard, outcome) = interrupt::wait_interruptible(
                    &self.inner.available,
                    heap,
                    Some(remaining),
                    &waker,
                );
                heap = guard;
                if outcome == WaitOutcome::Interrupted {
                    break Err(Interrupted);
                }
            } else {
                heap.leader = Some(me);
                let (guard, outcome) = interrupt::wait_interruptible(
                    &self.inner.available,
                    heap,
                    Some(delay_dur),
                    &waker,
                );
                heap = guard;
                if heap.leader == Some(me) {
                    heap.leader = None;
                }
                if outcome == WaitOutcome::Interrupted {
                    break Err(Interrupted);
                }
            }
        };
        if heap.leader.is_none() && !heap.items.is_empty() {
            self.inner.available.notify_one();
        }
        drop(heap);
        if result.is_err() {
            interrupt::interrupted();
        }
        result
    }

    fn poll(&self) -> Option<Task> {
        let mut heap = self.inner.heap.lock().unwrap();
        if heap.items.is_empty() || sched(&heap.items[0]).delay_nanos() > 0 {
            return None;
        }
        Some(finish_poll(&mut heap.items))
    }

    fn remove(&self, task: &Task) -> bool {
        let mut heap = self.inner.heap.lock().unwrap();
        let Some(i) = Self::index_of(&heap.items, task) else {
            return false;
        };
        set_index(&heap.items[i], -1);
        let last = heap.items.pop().expect("non-empty heap");
        let s = heap.items.len();
        if s != i {
            heap.items[i] = last.clone();
            sift_down(&mut heap.items, i);
            if Arc::ptr_eq(&heap.items[i], &last) {
                sift_up(&mut heap.items, i);
            }
        }
        true
    }

    fn drain(&self) -> Vec<Task> {
        let mut heap = self.inner.heap.lock().unwrap();
        let out: Vec<Task> = heap.items.drain(..).collect();
        for t in &out {
            set_index(t, -1);
        }
        heap.leader = None;
        out
    }

    fn snapshot(&self) -> Vec<Task> {
        self.inner.heap.lock().unwrap().items.clone()
    }

    fn len(&self) -> usize {
        self.inner.heap.lock().unwrap().items.len()
    }
}


// Property tests against a reference model live in the sibling module.
#[cfg(test)]
#[path = "delay_tests.rs"]
mod delay_tests;
