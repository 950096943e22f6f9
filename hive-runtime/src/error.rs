//! Error taxonomy shared by every runtime operation.
//!
//! Each fallible call returns [`Result`]. The variants map one-to-one onto
//! stable negative status codes (see [`Error::code`]) so callers that log or
//! forward errors across a process boundary keep a compact representation.

use thiserror::Error;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// A handle, id, size, or calling context was not acceptable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A fixed-capacity pool or table is full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A blocking operation reached its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The peer of a blocking operation went away, or the runtime is tearing
    /// down.
    #[error("peer closed")]
    Closed,

    /// A non-blocking operation found nothing to do.
    #[error("operation would block")]
    WouldBlock,

    /// An operating-system call failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every live actor is waiting and no event source can wake any of them.
    #[error("deadlock: {blocked} actor(s) waiting with no pending event source")]
    Deadlock {
        /// Number of actors left waiting.
        blocked: usize,
    },
}

impl Error {
    /// Stable status code for this error. Success is `0`.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -1,
            Error::ResourceExhausted(_) => -2,
            Error::Timeout => -3,
            Error::Closed => -4,
            Error::WouldBlock => -5,
            Error::Io(_) => -6,
            Error::Deadlock { .. } => -7,
        }
    }

    /// Whether retrying the same call later can succeed.
    ///
    /// Pool exhaustion is transient: the caller yields or sleeps and tries
    /// again once other actors release what they hold.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_) | Error::WouldBlock)
    }
}
