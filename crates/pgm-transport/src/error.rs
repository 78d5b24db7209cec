//! # Errors and I/O Status
//!
//! Per-packet parse failures never surface to the caller — they are counted
//! and the packet dropped. [`PgmError`] covers the API boundary;
//! [`IoStatus`] is the result of the send/recv paths, where blocking,
//! rate-limiting, and loss-reset conditions are states rather than failures.

use thiserror::Error;

/// API-boundary errors.
#[derive(Debug, Error)]
pub enum PgmError {
    /// Configuration rejected before bind.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Setter called after the transport was bound.
    #[error("transport already bound")]
    AlreadyBound,

    /// Operation requires a bound transport.
    #[error("transport not bound")]
    NotBound,

    /// Operation on a destroyed transport.
    #[error("transport closed")]
    Closed,

    /// APDU larger than the transmit window can carry.
    #[error("message too large: {size} bytes exceeds {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// Underlying I/O failure, surfaced once.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a send or receive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Completed; count of bytes transferred.
    Normal(usize),
    /// Unrecoverable data loss detected on a peer; latched once per loss
    /// episode and cleared on the next call.
    Reset,
    /// A blocked read can now complete.
    FinishedWaitingRead,
    /// A blocked write can now complete.
    FinishedWaitingWrite,
    /// Non-blocking mode and the operation would block.
    WouldBlock,
    /// The rate limiter refused the send; retry later with identical
    /// arguments.
    RateLimited,
    /// A timer is due; the caller should run the tick before retrying.
    TimerPending,
    /// The transport was destroyed.
    Eof,
}

impl IoStatus {
    /// Whether a retry with the same arguments may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            IoStatus::WouldBlock | IoStatus::RateLimited | IoStatus::TimerPending
        )
    }
}
