//! Error type for the stream layer.
//!
//! Stream failures are state errors: the operation was legal but the stream
//! (or its peer) is not in a state to honor it. The stream itself stays in
//! whatever state it was in; none of these errors imply corruption. Errors
//! from an underlying source or sink propagate through wrappers verbatim.

use std::fmt;

/// Result alias used throughout the stream layer.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Stream-layer failures surfaced at the public boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamError {
    /// The stream was closed and its buffer released.
    Closed,
    /// A pipe endpoint was used before being connected to a peer.
    NotConnected,
    /// A pipe endpoint was connected to a peer that already has one.
    AlreadyConnected,
    /// The pipe was closed on the side the operation needs.
    PipeClosed,
    /// The write side died without closing and the ring is drained.
    PipeBroken,
    /// The read side died while the writer was blocked on a full ring.
    ReadEndDead,
    /// `reset` was called with no mark set, or the mark was discarded.
    InvalidMark,
    /// The stream does not support mark/reset.
    MarkUnsupported,
    /// `unread` was called with a full pushback buffer.
    PushbackOverflow,
    /// A blocking wait was interrupted; the thread's interrupt flag is
    /// consumed when this is returned.
    Interrupted,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "stream closed"),
            Self::NotConnected => write!(f, "pipe not connected"),
            Self::AlreadyConnected => write!(f, "pipe already connected"),
            Self::PipeClosed => write!(f, "pipe closed"),
            Self::PipeBroken => write!(f, "pipe broken"),
            Self::ReadEndDead => write!(f, "read end dead"),
            Self::InvalidMark => write!(f, "invalid mark"),
            Self::MarkUnsupported => write!(f, "mark/reset not supported"),
            Self::PushbackOverflow => write!(f, "pushback buffer full"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for StreamError {}
