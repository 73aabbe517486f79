//! Execute-with-backoff.
//!
//! [`with_retry`] runs an operation, classifies each failure, and retries
//! retryable ones with exponential backoff until `max_attempts` is reached.
//! The delay before retry `n` (1-based) is
//! `initial_delay_ms * backoff_multiplier^(n - 1)`, capped at `max_delay_ms`.

use std::future::Future;
use std::time::Duration;

use ledgerlink_auth_engine::Provider;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classify::{Classify, ClassifiedError};

/// Retry policy for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// The default policy for `provider`. Intuit asks clients to back off
    /// harder, so QuickBooks starts at two seconds.
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::QuickBooks => Self {
                initial_delay_ms: 2_000,
                ..Self::default()
            },
            Provider::Ramp => Self::default(),
        }
    }

    /// Delay in milliseconds before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> u64 {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            delay.max(0.0) as u64
        }
    }
}

/// Outcome of [`with_retry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ClassifiedError>,
    pub attempts: u32,
    pub total_delay_ms: u64,
}

impl<T> RetryResult<T> {
    pub fn into_result(self) -> Result<T, ClassifiedError> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(data),
            (None, Some(error)) => Err(error),
            (None, None) => Err(ClassifiedError::new(
                crate::classify::ErrorCategory::Unknown,
                "operation produced no result",
            )),
        }
    }
}

/// Run `operation` under `config`. `context` labels the log lines.
pub async fn with_retry<T, E, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    context: &str,
) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0;
    let mut total_delay_ms = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(data) => {
                if attempts > 1 {
                    debug!(context = context, attempts, "operation succeeded after retry");
                }
                return RetryResult {
                    success: true,
                    data: Some(data),
                    error: None,
                    attempts,
                    total_delay_ms,
                };
            }
            Err(e) => {
                let classified = e.classify();
                if !classified.retryable || attempts >= max_attempts {
                    debug!(
                        context = context,
                        attempts,
                        category = %classified.category,
                        retryable = classified.retryable,
                        "giving up"
                    );
                    return RetryResult {
                        success: false,
                        data: None,
                        error: Some(classified),
                        attempts,
                        total_delay_ms,
                    };
                }

                let delay_ms = config.delay_for(attempts);
                warn!(
                    context = context,
                    attempt = attempts,
                    delay_ms,
                    category = %classified.category,
                    "retrying after failure"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                total_delay_ms += delay_ms;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::classify::ErrorCategory;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            backoff_multiplier: 2.0,
            max_delay_ms: 1_000,
        }
    }

    /// Fails `failures` times with `status`, then succeeds.
    async fn flaky(calls: &AtomicU32, failures: u32, status: u16) -> Result<&'static str, ClassifiedError> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            Err(ClassifiedError::from_status(status, "flaky"))
        } else {
            Ok("done")
        }
    }

    #[tokio::test]
    async fn converges_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| flaky(&calls, 2, 503), &fast(5), "test").await;

        assert!(result.success);
        assert_eq!(result.data, Some("done"));
        assert_eq!(result.attempts, 3);
        // 1ms + 2ms
        assert_eq!(result.total_delay_ms, 3);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| flaky(&calls, u32::MAX, 500), &fast(4), "test").await;

        assert!(!result.success);
        assert_eq!(result.attempts, 4);
        assert_eq!(result.total_delay_ms, 1 + 2 + 4);
        assert_eq!(result.error.unwrap().category, ErrorCategory::ServerError);
    }

    #[tokio::test]
    async fn non_retryable_stops_after_one_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| flaky(&calls, u32::MAX, 404), &fast(10), "test").await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.total_delay_ms, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_failures_are_not_backed_off() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| flaky(&calls, u32::MAX, 401), &fast(3), "test").await;
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error.unwrap().category, ErrorCategory::AuthExpired);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| flaky(&calls, 0, 500), &fast(0), "test").await;
        assert!(result.success);
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn delays_grow_and_cap() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), 1_000);
        assert_eq!(config.delay_for(2), 2_000);
        assert_eq!(config.delay_for(3), 4_000);
        assert_eq!(config.delay_for(10), 30_000);
        assert_eq!(config.delay_for(u32::MAX), 30_000);
    }

    #[test]
    fn quickbooks_backs_off_longer() {
        assert_eq!(RetryConfig::for_provider(Provider::QuickBooks).initial_delay_ms, 2_000);
        assert_eq!(RetryConfig::for_provider(Provider::Ramp).initial_delay_ms, 1_000);
    }

    #[test]
    fn into_result_prefers_data() {
        let ok: RetryResult<u8> = RetryResult {
            success: true,
            data: Some(7),
            error: None,
            attempts: 1,
            total_delay_ms: 0,
        };
        assert_eq!(ok.into_result().unwrap(), 7);
    }
}
