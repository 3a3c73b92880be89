//! Retry of whole units of work after transient serialization conflicts.
//!
//! The unit is re-run from scratch: callers pass a closure that opens its own
//! transaction, so nothing from a failed attempt leaks into the next one.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;
use crate::telemetry::metrics;

/// Bounded exponential backoff with additive jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on each subsequent one.
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(30),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^retry_index`, clamped to `max_delay`.
    pub fn backoff_cap(&self, retry_index: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_index).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Sleep before retry `retry_index` (0-based), given `jitter` in `[0, 1)`.
    pub fn delay_for(&self, retry_index: u32, jitter: f64) -> Duration {
        self.backoff_cap(retry_index) + self.base_delay.mul_f64(jitter.clamp(0.0, 1.0))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts `policy.max_attempts`. The last conflict is returned as-is.
pub async fn retry_on_conflict<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt - 1, rand::random::<f64>());
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "serialization conflict, retrying"
                );
                metrics::conflict_retries().add(1, &[]);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
