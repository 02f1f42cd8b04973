//! Timeout enforcement.
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; expiry drops the inner future, so
//!   cleanup runs through `Drop`
//! - Timeout errors are distinct from other errors

use std::future::Future;
use std::time::Duration;

use crate::config::schema::TimeoutConfig;

#[derive(Debug, thiserror::Error)]
#[error("{operation} timed out after {after:?}")]
pub struct TimeoutError {
    pub operation: &'static str,
    pub after: Duration,
}

/// Resolved deadlines from configuration.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub connect: Duration,
    pub request: Duration,
    pub idle: Duration,
}

impl Deadlines {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            connect: Duration::from_secs(config.connect_secs),
            request: Duration::from_secs(config.request_secs),
            idle: Duration::from_secs(config.idle_secs),
        }
    }
}

impl Default for Deadlines {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

/// Run `fut` under a deadline.
pub async fn with_timeout<F, T>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| TimeoutError { operation, after })
}
