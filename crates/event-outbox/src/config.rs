//! Coordinator configuration.

use crate::{OutboxError, OutboxResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for batching, delivery timeouts and backoff.
///
/// Durations are stored in milliseconds so the struct maps one-to-one onto
/// the `outbox` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Maximum number of entries per batch.
    pub batch_size: usize,
    /// Base delay between flushes.
    pub flush_interval_ms: u64,
    /// Delivery timeout for one batch.
    pub request_timeout_ms: u64,
    /// Start flushing as soon as the coordinator is spawned.
    pub auto_start: bool,
    /// Ceiling for the backoff interval.
    pub max_retry_interval_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_ms: 5_000,
            request_timeout_ms: 90_000,
            auto_start: true,
            max_retry_interval_ms: 10 * 60 * 1000,
        }
    }
}

impl OutboxConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.max_retry_interval_ms)
    }

    /// Reject values the coordinator cannot run with.
    pub fn validate(&self) -> OutboxResult<()> {
        if self.batch_size == 0 {
            return Err(OutboxError::Config("batch_size must be at least 1".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(OutboxError::Config("flush_interval_ms must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(OutboxError::Config("request_timeout_ms must be positive".into()));
        }
        if self.max_retry_interval_ms < self.flush_interval_ms {
            return Err(OutboxError::Config(format!(
                "max_retry_interval_ms ({}) is below flush_interval_ms ({})",
                self.max_retry_interval_ms, self.flush_interval_ms
            )));
        }
        Ok(())
    }
}
