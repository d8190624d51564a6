use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::core::errors::{QuotaError, QuotaResult};
use crate::core::types::UsageCounter;

/// Result of an atomic check-and-increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// Counter incremented; `used` is the value after the charge
    Charged { used: u32 },
    /// Nothing changed; `remaining` units were left
    Exceeded { remaining: u32 },
}

/// Durable per-user usage counters keyed by `(user, counter, period)`.
///
/// Implementations must make `try_charge` and `refund` atomic per key.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn used(&self, user_id: &str, counter: UsageCounter, period: &str) -> QuotaResult<u32>;

    /// Increment by `count` only when the result stays within `limit`
    async fn try_charge(
        &self,
        user_id: &str,
        counter: UsageCounter,
        period: &str,
        count: u32,
        limit: u32,
    ) -> QuotaResult<ChargeOutcome>;

    /// Decrement by `count`; returns the counter value afterwards
    async fn refund(
        &self,
        user_id: &str,
        counter: UsageCounter,
        period: &str,
        count: u32,
    ) -> QuotaResult<u32>;
}

type CounterKey = (String, UsageCounter, String);

/// Process-local store; the entry lock makes each key's check-and-increment atomic
#[derive(Default)]
pub struct InMemoryQuotaStore {
    counters: DashMap<CounterKey, u32>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(user_id: &str, counter: UsageCounter, period: &str) -> CounterKey {
        (user_id.to_string(), counter, period.to_string())
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn used(&self, user_id: &str, counter: UsageCounter, period: &str) -> QuotaResult<u32> {
        Ok(self
            .counters
            .get(&Self::key(user_id, counter, period))
            .map(|v| *v)
            .unwrap_or(0))
    }

    async fn try_charge(
        &self,
        user_id: &str,
        counter: UsageCounter,
        period: &str,
        count: u32,
        limit: u32,
    ) -> QuotaResult<ChargeOutcome> {
        let mut entry = self
            .counters
            .entry(Self::key(user_id, counter, period))
            .or_insert(0);
        let used = *entry;
        match used.checked_add(count) {
            Some(next) if next <= limit => {
                *entry = next;
                debug!("Charged {} {} for {} ({}/{})", count, counter, user_id, next, limit);
                Ok(ChargeOutcome::Charged { used: next })
            }
            _ => Ok(ChargeOutcome::Exceeded {
                remaining: limit.saturating_sub(used),
            }),
        }
    }

    async fn refund(
        &self,
        user_id: &str,
        counter: UsageCounter,
        period: &str,
        count: u32,
    ) -> QuotaResult<u32> {
        let mut entry = self
            .counters
            .entry(Self::key(user_id, counter, period))
            .or_insert(0);
        if *entry < count {
            return Err(QuotaError::RefundUnderflow {
                counter,
                period: period.to_string(),
                count,
                used: *entry,
            });
        }
        *entry -= count;
        debug!("Refunded {} {} for {} (now {})", count, counter, user_id, *entry);
        Ok(*entry)
    }
}
