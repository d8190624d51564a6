// API key pool with health tracking and rate-limit cooldowns
//
// Spreads LLM calls across keys and steers away from keys that are
// rate limited or repeatedly failing

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Failures in a row before a key is benched
const UNHEALTHY_AFTER: u32 = 3;
/// How long a benched key sits out before it is probed again
const RECOVERY_WINDOW: Duration = Duration::from_secs(300);
/// Cooldown applied on 429 when the server gives no Retry-After
const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHealth {
    Healthy,
    CoolingDown,
    Unhealthy,
}

#[derive(Debug, Clone)]
struct KeyState {
    key: String,
    index: usize,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    cooldown_until: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
}

impl KeyState {
    fn new(key: String, index: usize) -> Self {
        Self {
            key,
            index,
            consecutive_failures: 0,
            last_failure: None,
            cooldown_until: None,
            total_requests: 0,
            total_failures: 0,
        }
    }

    fn health(&self, now: Instant) -> KeyHealth {
        if self.consecutive_failures >= UNHEALTHY_AFTER {
            return KeyHealth::Unhealthy;
        }
        match self.cooldown_until {
            Some(until) if until > now => KeyHealth::CoolingDown,
            _ => KeyHealth::Healthy,
        }
    }

    fn may_probe(&self, now: Instant) -> bool {
        self.last_failure
            .map(|t| now.duration_since(t) > RECOVERY_WINDOW)
            .unwrap_or(true)
    }
}

/// Usage statistics for one key
#[derive(Debug, Clone)]
pub struct KeyStats {
    pub index: usize,
    pub health: KeyHealth,
    pub total_requests: u64,
    pub total_failures: u64,
}

pub struct ApiKeyPool {
    keys: RwLock<Vec<KeyState>>,
    round_robin: AtomicUsize,
}

impl ApiKeyPool {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys: RwLock::new(
                keys.into_iter()
                    .enumerate()
                    .map(|(i, key)| KeyState::new(key, i))
                    .collect(),
            ),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Next usable key as `(index, key)`, or `None` when every key is cooling
    /// down or benched
    pub async fn acquire(&self) -> Option<(usize, String)> {
        let keys = self.keys.read().await;
        let now = Instant::now();

        let healthy: Vec<&KeyState> = keys
            .iter()
            .filter(|k| k.health(now) == KeyHealth::Healthy)
            .collect();
        if !healthy.is_empty() {
            let pick = healthy[self.round_robin.fetch_add(1, Ordering::Relaxed) % healthy.len()];
            debug!("Using API key {} ({} healthy)", pick.index, healthy.len());
            return Some((pick.index, pick.key.clone()));
        }

        let probe = keys
            .iter()
            .find(|k| k.health(now) == KeyHealth::Unhealthy && k.may_probe(now));
        if let Some(k) = probe {
            warn!("All API keys unhealthy, probing key {}", k.index);
            return Some((k.index, k.key.clone()));
        }

        warn!("No API key available ({} configured)", keys.len());
        None
    }

    /// Time until the earliest cooling-down key becomes usable again
    pub async fn next_available_in(&self) -> Option<Duration> {
        let keys = self.keys.read().await;
        let now = Instant::now();
        keys.iter()
            .filter_map(|k| k.cooldown_until)
            .filter(|until| *until > now)
            .map(|until| until - now)
            .min()
    }

    pub async fn record_success(&self, index: usize) {
        let mut keys = self.keys.write().await;
        if let Some(k) = keys.get_mut(index) {
            if k.consecutive_failures >= UNHEALTHY_AFTER {
                info!("API key {} recovered", k.index);
            }
            k.total_requests += 1;
            k.consecutive_failures = 0;
            k.last_failure = None;
            k.cooldown_until = None;
        }
    }

    pub async fn record_failure(&self, index: usize) {
        let mut keys = self.keys.write().await;
        if let Some(k) = keys.get_mut(index) {
            k.total_requests += 1;
            k.total_failures += 1;
            k.consecutive_failures += 1;
            k.last_failure = Some(Instant::now());
            if k.consecutive_failures == UNHEALTHY_AFTER {
                warn!(
                    "API key {} marked unhealthy ({} consecutive failures)",
                    k.index, k.consecutive_failures
                );
            }
        }
    }

    /// Bench a key until the server's retry-after elapses
    pub async fn record_rate_limited(&self, index: usize, retry_after: Option<Duration>) {
        let mut keys = self.keys.write().await;
        if let Some(k) = keys.get_mut(index) {
            let cooldown = retry_after.unwrap_or(DEFAULT_RATE_LIMIT_COOLDOWN);
            k.total_requests += 1;
            k.total_failures += 1;
            k.cooldown_until = Some(Instant::now() + cooldown);
            debug!("API key {} rate limited, cooling down {:?}", k.index, cooldown);
        }
    }

    pub async fn stats(&self) -> Vec<KeyStats> {
        let keys = self.keys.read().await;
        let now = Instant::now();
        keys.iter()
            .map(|k| KeyStats {
                index: k.index,
                health: k.health(now),
                total_requests: k.total_requests,
                total_failures: k.total_failures,
            })
            .collect()
    }

    pub async fn total_keys(&self) -> usize {
        self.keys.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_robin() {
        let pool = ApiKeyPool::new(vec!["a".into(), "b".into(), "c".into()]);
        let (first, _) = pool.acquire().await.unwrap();
        let (second, _) = pool.acquire().await.unwrap();
        let (third, _) = pool.acquire().await.unwrap();
        let (fourth, _) = pool.acquire().await.unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(fourth, first);
    }

    #[tokio::test]
    async fn test_rate_limited_key_is_skipped() {
        let pool = ApiKeyPool::new(vec!["a".into(), "b".into()]);
        pool.record_rate_limited(0, Some(Duration::from_secs(30))).await;

        for _ in 0..4 {
            let (idx, key) = pool.acquire().await.unwrap();
            assert_eq!(idx, 1);
            assert_eq!(key, "b");
        }
        let wait = pool.next_available_in().await.unwrap();
        assert!(wait <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_all_cooling_down_returns_none() {
        let pool = ApiKeyPool::new(vec!["a".into()]);
        pool.record_rate_limited(0, None).await;
        assert!(pool.acquire().await.is_none());
    }

    #[tokio::test]
    async fn test_health_tracking_and_recovery() {
        let pool = ApiKeyPool::new(vec!["a".into(), "b".into()]);
        for _ in 0..3 {
            pool.record_failure(0).await;
        }
        let stats = pool.stats().await;
        assert_eq!(stats[0].health, KeyHealth::Unhealthy);
        assert_eq!(stats[0].total_failures, 3);

        pool.record_success(0).await;
        assert_eq!(pool.stats().await[0].health, KeyHealth::Healthy);
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let pool = ApiKeyPool::new(Vec::new());
        assert!(pool.acquire().await.is_none());
        assert_eq!(pool.total_keys().await, 0);
    }
}
