//! Retry policy: maps a delivery outcome to the coordinator's next move.
//!
//! | Outcome                                   | Verdict                          |
//! |-------------------------------------------|----------------------------------|
//! | timeout after the full request timeout    | [`Verdict::RetryNow`]            |
//! | status >= 500, or no status at all        | [`Verdict::Backoff`]             |
//! | 413 with more than one entry              | [`Verdict::Shrink`]              |
//! | 413 with a single entry                   | [`Verdict::DropOversized`]       |
//! | anything else, including success          | [`Verdict::Acknowledge`]         |
//!
//! Backoff doubles the coordinator's current flush interval, so consecutive
//! server errors without `Retry-After` produce 2x, 4x, 8x ... of the base
//! interval until the ceiling.

use crate::transport::{DeliveryFailure, DeliveryResult};
use std::time::Duration;

/// Default cap on the backoff interval.
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Payload Too Large.
const STATUS_PAYLOAD_TOO_LARGE: u16 = 413;

/// What the coordinator does after a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Flush again right away with the same batch size.
    RetryNow,
    /// Keep the entries and flush again after the delay.
    Backoff(Duration),
    /// Keep the entries and continue with the smaller batch size.
    Shrink(usize),
    /// The single entry can never be delivered; remove it.
    DropOversized,
    /// The collector has the batch; remove it.
    Acknowledge,
}

/// Backoff and batch-size arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_interval: Duration) -> Self {
        Self { max_interval }
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Classify a delivery result.
    ///
    /// `elapsed` is the time since the request was started and `batch_len`
    /// the number of queue entries the batch was built from.
    pub fn classify(
        &self,
        result: &DeliveryResult,
        elapsed: Duration,
        request_timeout: Duration,
        current_interval: Duration,
        current_batch_size: usize,
        batch_len: usize,
    ) -> Verdict {
        if matches!(result.error, Some(DeliveryFailure::Timeout)) && elapsed >= request_timeout {
            return Verdict::RetryNow;
        }

        if result.status >= 500 || result.status == 0 {
            return Verdict::Backoff(self.server_error_delay(current_interval, result.retry_after()));
        }

        if result.status == STATUS_PAYLOAD_TOO_LARGE {
            if batch_len > 1 {
                return Verdict::Shrink(shrink_batch_size(current_batch_size, batch_len));
            }
            return Verdict::DropOversized;
        }

        Verdict::Acknowledge
    }

    /// Delay before retrying after a server error: the server's
    /// `Retry-After` if given, otherwise twice the current interval, never
    /// above the ceiling.
    pub fn server_error_delay(&self, current_interval: Duration, retry_after: Option<Duration>) -> Duration {
        let delay = retry_after.unwrap_or_else(|| current_interval.saturating_mul(2));
        delay.min(self.max_interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(MAX_RETRY_INTERVAL)
    }
}

/// Batch size after a 413 for a batch of `batch_len > 1` entries: half the
/// current size, at least 1, and strictly smaller than the rejected batch.
pub fn shrink_batch_size(current_batch_size: usize, batch_len: usize) -> usize {
    let halved = (current_batch_size / 2).max(1);
    current_batch_size
        .min(halved)
        .min(batch_len.saturating_sub(1))
        .max(1)
}

/// Parse a `Retry-After` header given in seconds.
///
/// Leading whitespace is ignored and parsing stops at the first non-digit.
/// Zero or unparseable values yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let digits: String = value
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let seconds: u64 = digits.parse().ok()?;
    if seconds == 0 {
        return None;
    }
    Some(Duration::from_secs(seconds))
}
