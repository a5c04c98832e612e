//! Exponential backoff with jitter for a retryable operation.
//!
//! Generalizes the spawn-retry loop pattern to any operation whose error reports an
//! [`ErrorCode`](warden_error::ErrorCode): retryability is read off `err.code().is_retryable()`
//! rather than a hand-maintained per-call-site whitelist of variants.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant, SystemTime};

use warden_error::AsErrorCode;

/// Backoff policy for a retryable operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial attempt. `0` disables retries.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Maximum delay cap for exponential backoff.
    pub max_delay: Duration,
    /// Overall wall-clock timeout across all attempts.
    pub overall_timeout: Duration,
    /// Jitter factor in `[0.0, 1.0]`. `0` disables jitter, `1` is full jitter.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            overall_timeout: Duration::from_secs(20),
            jitter_factor: 0.3,
        }
    }
}

/// A single failed attempt, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// Zero-indexed attempt number.
    pub attempt: u32,
    /// The error's display string.
    pub error: String,
    /// Backoff delay applied before the next attempt.
    pub delay: Duration,
}

/// Metadata captured across all attempts of a successful retry loop.
#[derive(Debug, Clone, Default)]
pub struct RetryMetadata {
    /// Total number of attempts made (including the successful one).
    pub total_attempts: u32,
    /// Every failed attempt, in order.
    pub failed_attempts: Vec<RetryAttempt>,
    /// Wall-clock time spanning all attempts.
    pub total_duration: Duration,
}

/// A retry loop's outcome: the value it eventually produced, plus its history.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The successfully produced value.
    pub value: T,
    /// Attempt history (empty if the first attempt succeeded).
    pub metadata: RetryMetadata,
}

/// Errors arising from the retry loop itself, wrapping the operation's own error.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: fmt::Display> {
    /// A non-retryable error from the operation, or the last retryable failure once
    /// the retry budget was exhausted.
    #[error("{0}")]
    Inner(E),

    /// The overall timeout elapsed before a retry could be attempted.
    #[error("retry budget exhausted after {0:?}")]
    TimedOut(Duration),
}

/// Compute the backoff delay for a given zero-indexed attempt number.
#[must_use]
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let delay_ms = (config.base_delay.as_millis() as u64).saturating_mul(exp);
    let capped_ms = delay_ms.min(config.max_delay.as_millis() as u64);

    let jitter_factor = config.jitter_factor.clamp(0.0, 1.0);
    if jitter_factor > 0.0 && capped_ms > 0 {
        let jitter_range = (capped_ms as f64 * jitter_factor) as u64;
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        let pseudo = nanos.wrapping_mul(attempt as u64 + 1);
        let jitter = if jitter_range > 0 { pseudo % jitter_range } else { 0 };
        Duration::from_millis(capped_ms.saturating_sub(jitter))
    } else {
        Duration::from_millis(capped_ms)
    }
}

/// Call `op` up to `config.max_retries + 1` times with exponential backoff, retrying
/// only while `err.code().is_retryable()` and the overall timeout hasn't elapsed.
pub async fn retry_async<T, E, F, Fut>(config: &RetryConfig, mut op: F) -> Result<RetryOutcome<T>, RetryError<E>>
where
    E: AsErrorCode + fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let max_attempts = config.max_retries + 1;
    let mut failed_attempts = Vec::new();

    for attempt in 0..max_attempts {
        if start.elapsed() >= config.overall_timeout {
            return Err(RetryError::TimedOut(config.overall_timeout));
        }

        match op().await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    metadata: RetryMetadata {
                        total_attempts: attempt + 1,
                        failed_attempts,
                        total_duration: start.elapsed(),
                    },
                });
            }
            Err(err) => {
                let is_last = attempt + 1 >= max_attempts;
                if !err.code().is_retryable() || is_last {
                    return Err(RetryError::Inner(err));
                }

                let delay = compute_delay(config, attempt);
                let remaining = config.overall_timeout.saturating_sub(start.elapsed());
                if delay > remaining {
                    failed_attempts.push(RetryAttempt {
                        attempt,
                        error: err.to_string(),
                        delay,
                    });
                    return Err(RetryError::TimedOut(config.overall_timeout));
                }

                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retryable error, backing off");
                failed_attempts.push(RetryAttempt {
                    attempt,
                    error: err.to_string(),
                    delay,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(RetryError::TimedOut(config.overall_timeout))
}
