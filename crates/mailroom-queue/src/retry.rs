//! Retry backoff.

use crate::error::{Error, Result};
use std::time::Duration;

/// Exponential backoff for records a handler asked to retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Reaching it dead-letters the record.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Cap on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Checks that the policy makes progress.
    ///
    /// # Errors
    ///
    /// Returns an error for zero attempts or a multiplier below 1.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::InvalidConfig("multiplier must be at least 1.0".into()));
        }
        Ok(())
    }

    /// Delay after failed attempt number `attempt` (1-based):
    /// `initial * multiplier^(attempt - 1)`, capped at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// True once `attempt` attempts have been used up.
    #[must_use]
    pub const fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
