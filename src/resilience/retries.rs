//! Retry policy for upstream requests.
//!
//! # Design Decisions
//! - Only transport failures are retried, never an upstream HTTP status
//! - A retry is only possible while nothing has reached the client
//! - Jittered backoff between attempts

use std::time::Duration;

use crate::config::UpstreamConfig;
use crate::resilience::backoff::calculate_backoff;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub fn should_retry(&self, attempt: u32, downstream_touched: bool) -> bool {
        !downstream_touched && attempt < self.max_attempts
    }

    /// Delay before attempt `attempt + 1`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay_ms, self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UpstreamConfig::default())
    }
}
