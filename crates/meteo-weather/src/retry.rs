//! Retry utilities for provider requests with exponential backoff.
//!
//! Retries transient failures only:
//! - Timeouts and connection resets
//! - 5xx server errors and 408 Request Timeout
//!
//! It does NOT retry:
//! - Other 4xx client errors, including 401/403 and 429 rate limiting
//! - Malformed payloads

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;

use crate::error::{WeatherError, WeatherResult};

/// Default retry configuration
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 250;
pub const DEFAULT_MAX_DELAY_MS: u64 = 4000;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt (doubles each attempt)
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(1, 0, 0)
    }

    /// Delay after the given failed attempt (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Exponential backoff: initial_delay * 2^attempt
        let factor = 2u64.saturating_pow(attempt);
        let delay_ms = (self.initial_delay.as_millis() as u64).saturating_mul(factor);
        let capped = delay_ms.min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    NoRetry,
}

/// Classify an HTTP status for the retry policy.
pub fn classify_status(status: StatusCode) -> RetryDecision {
    if status.is_server_error() {
        tracing::debug!("Server error ({}), will retry", status);
        return RetryDecision::Retry;
    }

    if status == StatusCode::REQUEST_TIMEOUT {
        tracing::debug!("Request timeout (408), will retry");
        return RetryDecision::Retry;
    }

    // 4xx (including 401, 403 and 429) is final
    RetryDecision::NoRetry
}

/// Map a non-success status to the error taxonomy.
pub fn status_error(status: StatusCode, body: &str) -> WeatherError {
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("unknown status").to_string()
    } else {
        body.chars().take(200).collect()
    };

    match classify_status(status) {
        RetryDecision::Retry => WeatherError::Network(format!("{}: {}", status, message)),
        RetryDecision::NoRetry => WeatherError::Client {
            status: status.as_u16(),
            message,
        },
    }
}

/// Run an operation with retry logic.
///
/// Returns the first success, the first non-retryable error, or the last
/// retryable error once all attempts are spent.
///
/// # Example
/// ```ignore
/// let record = with_retry(&RetryConfig::default(), || async { client.fetch_once(url).await }).await?;
/// ```
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> WeatherResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = WeatherResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt - 1);
            tracing::info!(
                "Retry attempt {} of {}, waiting {:?}",
                attempt + 1,
                max_attempts,
                delay
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!("Request succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                tracing::debug!("Non-retryable error: {}", e);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    "Retryable error on attempt {} of {}: {}",
                    attempt + 1,
                    max_attempts,
                    e
                );
                attempt += 1;
                if attempt >= max_attempts {
                    tracing::error!("All {} attempts exhausted", max_attempts);
                    return Err(e);
                }
            }
        }
    }
}
