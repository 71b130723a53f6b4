//! Manager configuration

use crate::error::{FanoutError, Result};
use std::time::Duration;

/// Tuning knobs for the notification manager and its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    /// Delay before reopening after a rejected resume token
    pub short_backoff: Duration,
    /// Delay before reopening after a transport failure, a closed cursor,
    /// or an unexpected error
    pub reconnect_backoff: Duration,
    /// How long `stop` waits for a worker task before aborting it
    pub shutdown_grace: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            short_backoff: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl NotificationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_short_backoff(mut self, value: Duration) -> Self {
        self.short_backoff = value;
        self
    }

    pub fn with_reconnect_backoff(mut self, value: Duration) -> Self {
        self.reconnect_backoff = value;
        self
    }

    pub fn with_shutdown_grace(mut self, value: Duration) -> Self {
        self.shutdown_grace = value;
        self
    }

    /// Reject configurations that would spin or hang.
    pub fn validate(&self) -> Result<()> {
        if self.short_backoff.is_zero() {
            return Err(FanoutError::config("short_backoff must be non-zero"));
        }
        if self.reconnect_backoff.is_zero() {
            return Err(FanoutError::config("reconnect_backoff must be non-zero"));
        }
        if self.shutdown_grace.is_zero() {
            return Err(FanoutError::config("shutdown_grace must be non-zero"));
        }
        Ok(())
    }
}
