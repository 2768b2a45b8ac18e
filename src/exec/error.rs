//! Error types for the executor family.

use std::fmt;
use std::sync::Arc;

/// A task was refused by the pool (saturated or shut down).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RejectedError;

impl fmt::Display for RejectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rejected execution")
    }
}

impl std::error::Error for RejectedError {}

/// A blocking executor operation was interrupted; the thread's interrupt
/// flag is consumed when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interrupted")
    }
}

impl std::error::Error for Interrupted {}

/// Why a future's outcome could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// The task was cancelled before completing.
    Cancelled,
    /// The task body panicked; carries the panic message.
    Panicked(Arc<str>),
    /// A timed `get` ran out of time before a terminal state.
    TimedOut,
    /// The waiting thread was interrupted.
    Interrupted,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Panicked(msg) => write!(f, "execution failed: {msg}"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Failure of a multi-task submission (`invoke_all` / `invoke_any`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// A task could not be enqueued.
    Rejected,
    /// The invoking thread was interrupted while waiting.
    Interrupted,
    /// The deadline passed before any task produced a result.
    TimedOut,
    /// Every task failed; carries the last failure.
    AllFailed(JoinError),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => write!(f, "rejected execution"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::TimedOut => write!(f, "timed out"),
            Self::AllFailed(err) => write!(f, "all tasks failed: {err}"),
        }
    }
}

impl std::error::Error for InvokeError {}
