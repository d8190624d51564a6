use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::core::errors::{ApiError, ApiErrorKind};
use crate::utils::Metrics;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Upstream considered down; calls fail fast
    Open,
    /// Probing whether upstream recovered
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive outage failures before opening
    pub failure_threshold: usize,
    /// Time spent open before probing
    pub cooldown: Duration,
    /// Consecutive probe successes needed to close again
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// Fails LLM calls fast while the upstream is having an outage.
///
/// Only outage-shaped failures (`Unavailable`, `Timeout`) move the breaker.
/// Rate limits are a per-key concern handled by the key pool, and
/// `QuotaExceeded`/`Other` say nothing about upstream health.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerInner>>,
    config: CircuitBreakerConfig,
    metrics: Option<Metrics>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, metrics: Option<Metrics>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            })),
            config,
            metrics,
        }
    }

    /// Ok when a call may proceed; an `Unavailable` error while open
    pub fn check(&self) -> Result<(), ApiError> {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    Ok(())
                } else {
                    Err(ApiError::unavailable(format!(
                        "LLM upstream circuit open, retry in {}s",
                        (self.config.cooldown - elapsed).as_secs()
                    )))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.consecutive_successes = 0;
                inner.opened_at = None;
            }
        }
    }

    pub fn record_failure(&self, kind: ApiErrorKind) {
        if !matches!(kind, ApiErrorKind::Unavailable | ApiErrorKind::Timeout) {
            return;
        }

        let mut inner = self.inner.write();
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        let should_open = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                "LLM circuit opened after {} consecutive outage failures",
                inner.consecutive_failures
            );
            if let Some(ref m) = self.metrics {
                m.record_circuit_breaker_trip();
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), None)
    }
}
