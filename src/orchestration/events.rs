use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use super::state::BatchState;
use crate::core::types::{Bbox, ExplanationRecord, UsageCounter};

/// Progress notifications emitted while a batch runs
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    StateChanged {
        batch_id: String,
        from: BatchState,
        to: BatchState,
    },
    RegionsDetected {
        batch_id: String,
        page_number: u32,
        regions: Vec<Bbox>,
    },
    RecordCreated(ExplanationRecord),
    RecordUpdated(ExplanationRecord),
    /// Placeholder removed without ever leaving the loading state
    RecordDropped { batch_id: String, record_id: u64 },
    QuotaReconciliationFailed {
        batch_id: String,
        user_id: String,
        counter: UsageCounter,
        period: String,
        count: u32,
        message: String,
    },
}

/// Event sender that tolerates a receiver that went away
#[derive(Clone)]
pub struct EventSink {
    tx: Option<UnboundedSender<BatchEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<BatchEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: BatchEvent) {
        if let Some(ref tx) = self.tx {
            if tx.send(event).is_err() {
                trace!("Batch event receiver dropped");
            }
        }
    }
}

impl From<UnboundedSender<BatchEvent>> for EventSink {
    fn from(tx: UnboundedSender<BatchEvent>) -> Self {
        Self::new(tx)
    }
}
