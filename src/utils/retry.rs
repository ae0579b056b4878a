use std::time::Duration;
use tokio::time::{sleep, Instant};

// ============================================================================
// Exponential Backoff Retry Strategy
// ============================================================================
//
// Used for broker (re)connection and subscription setup. Attempts are
// bounded by count and, optionally, by total elapsed time: a retry whose
// delay would overrun `max_elapsed` is not taken.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Growth factor between delays
    pub multiplier: f64,
    /// Total time budget across all attempts
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_elapsed: None,
        }
    }
}

impl RetryConfig {
    /// Unbounded attempts, bounded only by elapsed time.
    pub fn reconnect(max_elapsed: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            multiplier: 2.0,
            max_elapsed: Some(max_elapsed),
        }
    }

    /// More attempts with short initial delays, for setup that usually
    /// recovers quickly.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_elapsed: None,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let grown = Duration::from_millis(((delay.as_millis() as f64) * self.multiplier) as u64);
        grown.min(self.max_delay)
    }

    fn budget_allows(&self, started: Instant, delay: Duration) -> bool {
        match self.max_elapsed {
            Some(budget) => started.elapsed() + delay <= budget,
            None => true,
        }
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation succeeded
    Success(T),
    /// Operation failed after all retries
    Failed(E),
    /// Operation permanently failed (should not retry)
    PermanentFailure(E),
}

/// Check if an error is transient (should retry) or permanent (should not retry)
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// Execute an operation with exponential backoff retry
pub async fn retry_with_backoff<F, Fut, T, E>(config: RetryConfig, mut operation: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    run(config, &mut operation, |_| true).await
}

/// Retry only while the error reports itself as transient
pub async fn retry_on_transient<F, Fut, T, E>(config: RetryConfig, mut operation: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    run(config, &mut operation, IsTransient::is_transient).await
}

async fn run<F, Fut, T, E>(
    config: RetryConfig,
    operation: &mut F,
    retryable: impl Fn(&E) -> bool,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt = attempt, "Operation succeeded after retry");
                }
                return RetryResult::Success(result);
            }
            Err(error) => {
                if !retryable(&error) {
                    tracing::error!(error = %error, "Permanent failure detected, not retrying");
                    return RetryResult::PermanentFailure(error);
                }

                if attempt >= config.max_attempts || !config.budget_allows(started, delay) {
                    tracing::error!(
                        attempt = attempt,
                        elapsed_ms = started.elapsed().as_millis(),
                        error = %error,
                        "Operation failed after all retries"
                    );
                    return RetryResult::Failed(error);
                }

                tracing::warn!(
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying after delay"
                );

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_elapsed: None,
        }
    }

    #[tokio::test]
    async fn test_operation_sees_attempt_numbers_until_success() {
        let result = retry_with_backoff(quick(5), |attempt| async move {
            if attempt < 3 {
                Err(format!("connection refused on attempt {attempt}"))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert!(matches!(result, RetryResult::Success(3)));
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let result = retry_with_backoff(quick(2), |_attempt| async { Err::<(), _>("persistent failure") }).await;

        assert!(matches!(result, RetryResult::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_budget_stops_unbounded_attempts() {
        let config = RetryConfig {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            multiplier: 1.0,
            max_elapsed: Some(Duration::from_millis(350)),
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        let result = retry_with_backoff(config, |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("down") }
        })
        .await;

        assert!(matches!(result, RetryResult::Failed("down")));
        // attempts at 0ms, 100ms, 200ms, 300ms; a fifth would start at 400ms
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[derive(Debug)]
    struct Fatal;

    impl std::fmt::Display for Fatal {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fatal")
        }
    }

    impl IsTransient for Fatal {
        fn is_transient(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        let result = retry_on_transient(quick(5), |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Fatal) }
        })
        .await;

        assert!(matches!(result, RetryResult::PermanentFailure(Fatal)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
