use chrono::{DateTime, FixedOffset, Offset, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::store::{ChargeOutcome, QuotaStore};
use crate::core::config::QuotaConfig;
use crate::core::errors::{BatchError, BatchResult, QuotaResult};
use crate::core::types::{
    ChargeReceipt, CounterUsage, ExplanationMode, UsageCounter, UsagePeriod, UsageSnapshot,
    UsageTier,
};
use crate::utils::Metrics;

/// Applies tier limits and period scoping on top of a `QuotaStore`
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    config: QuotaConfig,
    offset: FixedOffset,
    metrics: Option<Metrics>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, config: QuotaConfig, metrics: Option<Metrics>) -> Self {
        let offset = FixedOffset::east_opt(config.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix());
        Self {
            store,
            config,
            offset,
            metrics,
        }
    }

    pub fn limit(&self, tier: UsageTier, counter: UsageCounter) -> u32 {
        let limits = self.config.limits(tier);
        match counter {
            UsageCounter::Fast => limits.fast,
            UsageCounter::Standard => limits.standard,
            UsageCounter::Quality => limits.quality,
            UsageCounter::Export => limits.export,
        }
    }

    /// Period key at `now`: `YYYY-MM-DD` for daily counters, `YYYY-MM` for monthly
    pub fn period_key_at(&self, counter: UsageCounter, now: DateTime<Utc>) -> String {
        let local = now.with_timezone(&self.offset);
        match counter.period() {
            UsagePeriod::Daily => local.format("%Y-%m-%d").to_string(),
            UsagePeriod::Monthly => local.format("%Y-%m").to_string(),
        }
    }

    pub fn period_key(&self, counter: UsageCounter) -> String {
        self.period_key_at(counter, Utc::now())
    }

    /// Remaining units of `counter` in the current period
    pub async fn remaining(&self, user_id: &str, tier: UsageTier, counter: UsageCounter) -> QuotaResult<u32> {
        let used = self.store.used(user_id, counter, &self.period_key(counter)).await?;
        Ok(self.limit(tier, counter).saturating_sub(used))
    }

    /// Charge `count` generations of `mode` up front, all or nothing
    #[instrument(skip(self))]
    pub async fn charge_mode(
        &self,
        user_id: &str,
        tier: UsageTier,
        mode: ExplanationMode,
        count: u32,
    ) -> BatchResult<ChargeReceipt> {
        self.charge(user_id, tier, mode.counter(), count)
            .await?
            .map_err(|remaining| BatchError::QuotaExceeded {
                mode,
                requested: count,
                remaining,
            })
    }

    /// Charge `count` document exports against the monthly counter
    #[instrument(skip(self))]
    pub async fn charge_export(&self, user_id: &str, tier: UsageTier, count: u32) -> BatchResult<ChargeReceipt> {
        self.charge(user_id, tier, UsageCounter::Export, count)
            .await?
            .map_err(|remaining| BatchError::ExportQuotaExceeded {
                requested: count,
                remaining,
            })
    }

    /// Inner result is `Err(remaining)` when the limit would be exceeded
    async fn charge(
        &self,
        user_id: &str,
        tier: UsageTier,
        counter: UsageCounter,
        count: u32,
    ) -> QuotaResult<Result<ChargeReceipt, u32>> {
        let period = self.period_key(counter);
        let limit = self.limit(tier, counter);
        match self.store.try_charge(user_id, counter, &period, count, limit).await? {
            ChargeOutcome::Charged { used } => {
                info!(
                    "Charged {} {} to {} for {} ({}/{})",
                    count, counter, user_id, period, used, limit
                );
                if let Some(ref m) = self.metrics {
                    m.record_quota_charge(counter, count);
                }
                Ok(Ok(ChargeReceipt {
                    user_id: user_id.to_string(),
                    counter,
                    period,
                    count,
                }))
            }
            ChargeOutcome::Exceeded { remaining } => {
                warn!(
                    "{} quota exceeded for {}: requested {}, remaining {}",
                    counter, user_id, count, remaining
                );
                Ok(Err(remaining))
            }
        }
    }

    /// Return `count` units of a prior charge to the period it was charged in
    #[instrument(skip(self, receipt), fields(user_id = %receipt.user_id, counter = %receipt.counter))]
    pub async fn refund(&self, receipt: &ChargeReceipt, count: u32) -> QuotaResult<()> {
        if count == 0 {
            return Ok(());
        }
        let used = self
            .store
            .refund(&receipt.user_id, receipt.counter, &receipt.period, count)
            .await;
        match used {
            Ok(used) => {
                info!(
                    "Refunded {} {} to {} for {} (now {})",
                    count, receipt.counter, receipt.user_id, receipt.period, used
                );
                if let Some(ref m) = self.metrics {
                    m.record_quota_refund(receipt.counter, count);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(ref m) = self.metrics {
                    m.record_refund_failure();
                }
                Err(e)
            }
        }
    }

    /// Current usage of every counter for `user_id`
    pub async fn usage(&self, user_id: &str, tier: UsageTier) -> QuotaResult<UsageSnapshot> {
        let mut counters = Vec::with_capacity(UsageCounter::ALL.len());
        for counter in UsageCounter::ALL {
            let period = self.period_key(counter);
            let used = self.store.used(user_id, counter, &period).await?;
            let limit = self.limit(tier, counter);
            counters.push(CounterUsage {
                counter,
                period,
                used,
                limit,
                remaining: limit.saturating_sub(used),
            });
        }
        Ok(UsageSnapshot {
            user_id: user_id.to_string(),
            tier,
            counters,
        })
    }
}
