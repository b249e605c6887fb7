//! Retry policy for outbound search index calls.

use std::time::Duration;

/// Linear backoff: the n-th retry waits `interval_start + n * interval_step`,
/// capped at `interval_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub interval_start: Duration,
    pub interval_step: Duration,
    pub interval_max: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            interval_start: Duration::ZERO,
            interval_step: Duration::ZERO,
            interval_max: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.interval_start
            .saturating_add(self.interval_step.saturating_mul(retry))
            .min(self.interval_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            interval_start: Duration::from_millis(200),
            interval_step: Duration::from_millis(200),
            interval_max: Duration::from_millis(600),
        }
    }
}
