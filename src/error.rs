//! Error types for the fan-out subsystem
//!
//! Two layers: [`FeedError`] classifies upstream cursor failures so workers
//! can pick a recovery strategy, and [`FanoutError`] is what the manager's
//! administrative API surfaces to callers.

use thiserror::Error;

/// Upstream change-feed errors, classified for recovery.
///
/// Workers never surface these to callers; the class decides how the
/// reconnect loop behaves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The resume token is invalid or has expired upstream.
    ///
    /// The worker discards its token and reopens from the current position.
    #[error("checkpoint invalid or expired")]
    InvalidCheckpoint,

    /// Transient transport failure (connection lost, timeout, ...).
    ///
    /// The worker keeps its token and retries after the long backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// A single record could not be decoded.
    ///
    /// Returned by `ChangeCursor::next`; the worker skips the record and
    /// keeps reading from the same cursor.
    #[error("record decode error: {0}")]
    Decode(String),
}

impl FeedError {
    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// True when the failure only affects one record, not the cursor.
    pub fn is_record_scoped(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// Errors surfaced by the manager's administrative API.
#[derive(Error, Debug)]
pub enum FanoutError {
    /// Invalid caller input (empty scope, empty source name, ...).
    /// Fails fast; no state is mutated.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation not legal in the current lifecycle state
    /// (e.g. `watch_all` before `start`).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Upstream feed error surfaced from an administrative call
    /// (e.g. source enumeration during `watch_all`).
    #[error("feed error: {0}")]
    Feed(#[from] FeedError),
}

impl FanoutError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// Result type for fan-out operations.
pub type Result<T> = std::result::Result<T, FanoutError>;
