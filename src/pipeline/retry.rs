//! Shared retry/backoff primitive and upstream pacing clock
//!
//! Every upstream call that can be rate limited (provider quote fetches,
//! lookup-table reads, recency-token fetches, broadcast) goes through
//! [`retry_with_backoff`]. Only errors that report themselves as transient
//! are retried; everything else fails immediately. Waits are cancellable.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors that can take part in a retry loop
pub trait Retryable: Sized {
    /// Whether retrying the same call might succeed
    fn is_transient(&self) -> bool;

    /// Value returned when the caller's cancellation token fires mid-retry
    fn cancelled() -> Self;
}

/// Retry configuration with jitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including initial attempt)
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds
    pub base_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 250,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff delays between attempts: base, 2*base, 4*base... capped and jittered
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor((self.base_backoff_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.max_backoff_ms))
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// Retry an async operation on transient errors, with exponential backoff
///
/// Returns the first success, the first permanent error, or the last
/// transient error once attempts are exhausted. If `cancel` fires while the
/// operation or a backoff wait is pending, returns `E::cancelled()`.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0u32;
    let max_attempts = config.max_attempts;
    let condition = |err: &E| {
        attempt += 1;
        if !err.is_transient() {
            warn!(
                operation = operation_name,
                error = %err,
                "Permanent error, not retrying"
            );
            return false;
        }
        if attempt < max_attempts {
            debug!(
                operation = operation_name,
                attempt = attempt,
                max_attempts = max_attempts,
                error = %err,
                "Transient error, backing off before retry"
            );
        } else {
            warn!(
                operation = operation_name,
                attempts = attempt,
                error = %err,
                "All retry attempts exhausted"
            );
        }
        true
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(E::cancelled()),
        result = RetryIf::spawn(config.delays(), operation, condition) => result,
    }
}

/// Process-wide minimum-interval pacer for upstream calls, keyed per upstream
///
/// Created once at startup and injected wherever upstream calls are made.
pub struct PacingClock {
    limiter: Option<DefaultKeyedRateLimiter<String>>,
}

impl PacingClock {
    /// At most one call per `min_interval` per key; zero disables pacing
    pub fn new(min_interval: Duration) -> Self {
        Self {
            limiter: Quota::with_period(min_interval).map(RateLimiter::keyed),
        }
    }

    pub fn disabled() -> Self {
        Self { limiter: None }
    }

    /// Wait for the next slot for `key`. Returns `false` if cancelled first.
    pub async fn pace(&self, key: &str, cancel: &CancellationToken) -> bool {
        let Some(limiter) = &self.limiter else {
            return !cancel.is_cancelled();
        };
        let key = key.to_string();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = limiter.until_key_ready(&key) => true,
        }
    }
}

impl std::fmt::Debug for PacingClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacingClock")
            .field("enabled", &self.limiter.is_some())
            .finish()
    }
}
