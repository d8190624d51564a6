// Per-user usage quotas: atomic store primitives and the tier-aware ledger

pub mod ledger;
pub mod store;

pub use ledger::QuotaLedger;
pub use store::{ChargeOutcome, InMemoryQuotaStore, QuotaStore};
