//! Packed pool lifecycle word.
//!
//! One `AtomicI32` carries both the run-state and the live worker count so a
//! transition touching both is observable atomically. The high three bits are
//! the run-state, ordered for monotone comparison:
//!
//! ```text
//! RUNNING < SHUTDOWN < STOP < TIDYING < TERMINATED
//! ```
//!
//! `RUNNING` is negative, so `c < SHUTDOWN` is the "still accepting work"
//! test on the whole word. The low 29 bits count workers; the count is the
//! number of threads permitted to start and not yet permitted to stop, which
//! may transiently differ from the live thread count.
//!
//! Run-state never decreases for the lifetime of a pool.

use std::sync::atomic::{AtomicI32, Ordering};

pub(crate) const COUNT_BITS: i32 = i32::BITS as i32 - 3;
pub(crate) const COUNT_MASK: i32 = (1 << COUNT_BITS) - 1;

pub(crate) const RUNNING: i32 = -1 << COUNT_BITS;
pub(crate) const SHUTDOWN: i32 = 0;
pub(crate) const STOP: i32 = 1 << COUNT_BITS;
pub(crate) const TIDYING: i32 = 2 << COUNT_BITS;
pub(crate) const TERMINATED: i32 = 3 << COUNT_BITS;

#[inline(always)]
pub(crate) fn run_state_of(c: i32) -> i32 {
    c & !COUNT_MASK
}

#[inline(always)]
pub(crate) fn worker_count_of(c: i32) -> usize {
    (c & COUNT_MASK) as usize
}

#[inline(always)]
pub(crate) fn ctl_of(rs: i32, wc: i32) -> i32 {
    rs | wc
}

#[inline(always)]
pub(crate) fn run_state_at_least(c: i32, s: i32) -> bool {
    c >= s
}

#[inline(always)]
pub(crate) fn run_state_less_than(c: i32, s: i32) -> bool {
    c < s
}

#[inline(always)]
pub(crate) fn is_running(c: i32) -> bool {
    c < SHUTDOWN
}

/// CAS the count up by one against an expected word.
#[inline]
pub(crate) fn try_increment_worker_count(ctl: &AtomicI32, expect: i32) -> bool {
    ctl.compare_exchange(expect, expect + 1, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// CAS the count down by one against an expected word.
#[inline]
pub(crate) fn try_decrement_worker_count(ctl: &AtomicI32, expect: i32) -> bool {
    ctl.compare_exchange(expect, expect - 1, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Unconditionally take one off the count.
#[inline]
pub(crate) fn decrement_worker_count(ctl: &AtomicI32) {
    ctl.fetch_sub(1, Ordering::AcqRel);
}

/// Raises the run-state to `target` if it is not already there or past it.
pub(crate) fn advance_run_state(ctl: &AtomicI32, target: i32) {
    loop {
        let c = ctl.load(Ordering::Acquire);
        if run_state_at_least(c, target)
            || ctl
                .compare_exchange(
                    c,
                    ctl_of(target, (worker_count_of(c)) as i32),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            break;
        }
    }
}
