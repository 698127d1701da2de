//! Error taxonomy for range scans.
//!
//! Reaching the end of a range is not an error: iterators report it as
//! `Ok(None)`. Everything here is either a failed fetch, a corrupt chunk, a
//! cancelled iterator, or a caller/contract bug.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RangeError>;

#[derive(Debug, Error)]
pub enum RangeError {
    /// The underlying scan RPC failed. Never retried by the iterator.
    #[error("range fetch failed: {0:#}")]
    Transport(#[source] anyhow::Error),

    /// A chunk's declared counts or lengths do not fit its buffer.
    #[error("malformed range chunk: {reason}")]
    MalformedChunk { reason: String },

    /// The iterator was cancelled; every later operation fails with this.
    #[error("range iterator was cancelled")]
    Cancelled,

    /// A contract violation such as a reentrant fetch.
    #[error("invalid range iterator state: {0}")]
    InvalidState(String),
}

impl RangeError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        RangeError::MalformedChunk {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        RangeError::InvalidState(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RangeError::Cancelled)
    }
}

impl From<anyhow::Error> for RangeError {
    fn from(err: anyhow::Error) -> Self {
        RangeError::Transport(err)
    }
}
