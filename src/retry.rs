//! Bounded retry with exponential backoff.
//!
//! Transient upstream failures (reputation API, storage, transport, compute
//! backend) are retried at the component boundary. Authorization and
//! state-machine errors are never retried; each error type decides through
//! its `is_retryable()`.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Backoff schedule: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(with = "crate::config::humantime_duration")]
    pub base_delay: Duration,
    #[serde(with = "crate::config::humantime_duration")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Retry an async operation while `is_retryable` says the error is transient.
///
/// Returns the first success, or the last error once attempts are exhausted
/// or a non-retryable error is seen.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable(&err) || attempt + 1 >= policy.max_attempts {
                    return Err(err);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Bound one attempt of an external call by `limit`.
pub async fn with_timeout<T, E, Fut>(
    limit: Duration,
    future: Fut,
    on_timeout: fn() -> E,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn is_transient(err: &TestError) -> bool {
        matches!(err, TestError::Transient)
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let result =
            retry_with_backoff(&fast_policy(3), || async { Ok::<_, TestError>(42) }, is_transient)
                .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            &fast_policy(5),
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    if attempt.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::Transient)
                    } else {
                        Ok(7)
                    }
                }
            },
            is_transient,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempt.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            &fast_policy(5),
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    attempt.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(TestError::Fatal)
                }
            },
            is_transient,
        )
        .await;

        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(attempt.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            &fast_policy(3),
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    attempt.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(TestError::Transient)
                }
            },
            is_transient,
        )
        .await;

        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(attempt.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(31), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_with_timeout_maps_expiry() {
        let result = with_timeout(
            Duration::from_millis(5),
            async {
                sleep(Duration::from_secs(30)).await;
                Ok::<i32, TestError>(1)
            },
            || TestError::Transient,
        )
        .await;
        assert!(matches!(result, Err(TestError::Transient)));

        let result = with_timeout(
            Duration::from_secs(1),
            async { Ok::<i32, TestError>(1) },
            || TestError::Fatal,
        )
        .await;
        assert_eq!(result.unwrap(), 1);
    }
}
