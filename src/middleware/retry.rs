// Retry policy for LLM calls, decided on ApiErrorKind
//
// Every attempt races a per-attempt timeout and the caller's cancellation
// token; backoff sleeps race the token too.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::config::BatchConfig;
use crate::core::errors::{ApiError, ApiErrorKind};
use crate::utils::Metrics;

/// Outcome of a cancellation-aware call
#[derive(Debug)]
pub enum Attempt<T> {
    Finished(T),
    Cancelled,
}

impl<T> Attempt<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Attempt::Cancelled)
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
    metrics: Option<Metrics>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            attempt_timeout,
            metrics: None,
        }
    }

    /// Policy for generation calls
    pub fn for_generation(config: &BatchConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.retry_base_delay,
            config.retry_max_delay,
            config.generation_timeout,
        )
    }

    /// Policy for recognition calls
    pub fn for_recognition(config: &BatchConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.retry_base_delay,
            config.retry_max_delay,
            config.recognition_timeout,
        )
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Wait before attempt `attempt + 1`. Server retry-after wins when present.
    pub fn delay_for(&self, attempt: u32, kind: ApiErrorKind) -> Duration {
        if let ApiErrorKind::RateLimited {
            retry_after: Some(after),
        } = kind
        {
            return after.min(self.max_delay);
        }

        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter_ms = capped.as_millis() as u64 / 4;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::random::<u64>() % jitter_ms)
        } else {
            Duration::ZERO
        };
        (capped + jitter).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable kind, runs out of
    /// attempts, or the token is cancelled.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Attempt<Result<T, ApiError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Attempt::Cancelled;
            }

            // A call that finishes in the same poll as cancellation still counts
            let outcome = tokio::select! {
                biased;
                result = tokio::time::timeout(self.attempt_timeout, op()) => {
                    result.unwrap_or_else(|_| Err(ApiError::timeout(self.attempt_timeout)))
                }
                _ = cancel.cancelled() => return Attempt::Cancelled,
            };

            let error = match outcome {
                Ok(value) => return Attempt::Finished(Ok(value)),
                Err(e) => e,
            };

            if !error.kind.is_retryable() || attempt >= self.max_attempts {
                if error.kind.is_retryable() {
                    warn!("Giving up after {} attempts: {}", attempt, error);
                }
                return Attempt::Finished(Err(error));
            }

            let delay = self.delay_for(attempt, error.kind);
            debug!(
                "Attempt {}/{} failed ({:?}): {}. Retrying in {:?}",
                attempt, self.max_attempts, error.kind, error, delay
            );
            if let Some(ref m) = self.metrics {
                m.record_retry();
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Attempt::Cancelled,
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_retries_rate_limit_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let c = Arc::clone(&calls);
        let result = quick_policy(3)
            .run(&token, || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ApiError::rate_limited(None, "slow down"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert!(matches!(result, Attempt::Finished(Ok("done"))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let c = Arc::clone(&calls);
        let result: Attempt<Result<(), ApiError>> = quick_policy(5)
            .run(&token, || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::other("bad request"))
                }
            })
            .await;
        match result {
            Attempt::Finished(Err(e)) => assert_eq!(e.kind, ApiErrorKind::Other),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let c = Arc::clone(&calls);
        let result: Attempt<Result<(), ApiError>> = quick_policy(3)
            .run(&token, || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::unavailable("503"))
                }
            })
            .await;
        assert!(matches!(result, Attempt::Finished(Err(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        token.cancel();
        let c = Arc::clone(&calls);
        let result = quick_policy(3)
            .run(&token, || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(result.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_in_flight_call() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result: Attempt<Result<(), ApiError>> = quick_policy(3)
            .run(&token, || std::future::pending::<Result<(), ApiError>>())
            .await;
        assert!(result.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out() {
        let token = CancellationToken::new();
        let policy = RetryPolicy::new(
            1,
            Duration::from_millis(1),
            Duration::from_millis(5),
            Duration::from_secs(120),
        );
        let result: Attempt<Result<(), ApiError>> = policy
            .run(&token, || std::future::pending::<Result<(), ApiError>>())
            .await;
        match result {
            Attempt::Finished(Err(e)) => assert_eq!(e.kind, ApiErrorKind::Timeout),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_delay_honors_retry_after_and_cap() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_secs(2),
            Duration::from_secs(10),
        );
        let kind = ApiErrorKind::RateLimited {
            retry_after: Some(Duration::from_millis(700)),
        };
        assert_eq!(policy.delay_for(1, kind), Duration::from_millis(700));

        let long = ApiErrorKind::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(policy.delay_for(1, long), Duration::from_secs(2));

        let first = policy.delay_for(1, ApiErrorKind::Unavailable);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(125));
        assert!(policy.delay_for(10, ApiErrorKind::Unavailable) <= Duration::from_secs(2));
    }
}
