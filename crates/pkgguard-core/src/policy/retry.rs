//! Status-aware retry with exponential backoff and `Retry-After` support.
//!
//! Decision table for a failed attempt:
//!
//! | failure                       | action                                   |
//! |-------------------------------|------------------------------------------|
//! | 401 / 403                     | give up immediately                      |
//! | 429 with a positive hint      | wait exactly the hinted delay            |
//! | anything else                 | wait `base_delay * 2^attempt`            |
//! | `max_retries` already spent   | give up, wrap in `RetriesExhausted`      |

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ApiError;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_delay: Duration,
    /// Optional cap on the exponential delay. Server hints are never capped.
    pub max_delay: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: None,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again.
    Retry(Duration),
    /// Stop and report the error.
    GiveUp,
}

/// Stateless retry policy: computes the next step given the failed attempt.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Exponential delay after the failed attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self
            .config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);
        match self.config.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Decide what follows the failed attempt `attempt` (0-based).
    pub fn decide(&self, attempt: u32, err: &ApiError) -> RetryDecision {
        if !err.is_retryable() || attempt >= self.config.max_retries {
            return RetryDecision::GiveUp;
        }
        if err.is_rate_limited() {
            if let Some(hint) = err.retry_after().filter(|d| !d.is_zero()) {
                return RetryDecision::Retry(hint);
            }
        }
        RetryDecision::Retry(self.backoff(attempt))
    }
}

/// Run `operation` until it succeeds or the policy gives up.
///
/// The closure receives the 0-based attempt number. Authentication failures
/// are returned untouched after a single attempt; any other error that
/// outlives the retry budget comes back as [`ApiError::RetriesExhausted`].
pub async fn execute_with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0u32;
    loop {
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        match policy.decide(attempt, &err) {
            RetryDecision::Retry(delay) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    status = err.status(),
                    error = %err,
                    "retrying request"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            RetryDecision::GiveUp if !err.is_retryable() => {
                tracing::debug!(attempt = attempt + 1, error = %err, "not retrying");
                return Err(err);
            }
            RetryDecision::GiveUp => {
                tracing::error!(
                    attempts = attempt + 1,
                    status = err.status(),
                    error = %err,
                    "max retries exceeded"
                );
                return Err(ApiError::RetriesExhausted {
                    attempts: attempt + 1,
                    source: Box::new(err),
                });
            }
        }
    }
}

/// Parse a `Retry-After` header value: delta-seconds or an HTTP-date.
///
/// Returns `None` for unparseable, zero, negative or past values.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if !(secs.is_finite() && secs > 0.0) {
            return None;
        }
        return Duration::try_from_secs_f64(secs).ok();
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    (at.with_timezone(&Utc) - now).to_std().ok().filter(|d| !d.is_zero())
}

/// [`parse_retry_after`] against the current wall clock.
pub fn retry_after_from_header(value: &str) -> Option<Duration> {
    parse_retry_after(value, Utc::now())
}
