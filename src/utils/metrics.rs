use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::UsageCounter;
use crate::orchestration::BatchState;

/// Process-wide metrics collector.
///
/// Tracks API usage, detection timings, batch outcomes and quota movement.
/// Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // API
    api_calls_total: AtomicUsize,
    api_calls_success: AtomicUsize,
    api_calls_failed: AtomicUsize,
    api_tokens_input: AtomicU64,
    api_tokens_output: AtomicU64,
    api_latency_ms: RwLock<Vec<u64>>,

    // Detection
    detection_duration_ms: RwLock<Vec<u64>>,
    pages_detected: AtomicUsize,
    regions_detected: AtomicUsize,

    // Batches, keyed by terminal state name
    batch_outcomes: DashMap<&'static str, AtomicUsize>,
    items_completed: AtomicUsize,
    items_failed: AtomicUsize,
    retries: AtomicUsize,

    // Quota, keyed by counter
    quota_charged: DashMap<&'static str, AtomicU64>,
    quota_refunded: DashMap<&'static str, AtomicU64>,
    refund_failures: AtomicUsize,

    circuit_breaker_trips: AtomicUsize,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                api_calls_total: AtomicUsize::new(0),
                api_calls_success: AtomicUsize::new(0),
                api_calls_failed: AtomicUsize::new(0),
                api_tokens_input: AtomicU64::new(0),
                api_tokens_output: AtomicU64::new(0),
                api_latency_ms: RwLock::new(Vec::new()),
                detection_duration_ms: RwLock::new(Vec::new()),
                pages_detected: AtomicUsize::new(0),
                regions_detected: AtomicUsize::new(0),
                batch_outcomes: DashMap::new(),
                items_completed: AtomicUsize::new(0),
                items_failed: AtomicUsize::new(0),
                retries: AtomicUsize::new(0),
                quota_charged: DashMap::new(),
                quota_refunded: DashMap::new(),
                refund_failures: AtomicUsize::new(0),
                circuit_breaker_trips: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_api_call(&self, success: bool, duration: Duration, input_tokens: u64, output_tokens: u64) {
        self.inner.api_calls_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.api_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.api_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.api_tokens_input.fetch_add(input_tokens, Ordering::Relaxed);
        self.inner.api_tokens_output.fetch_add(output_tokens, Ordering::Relaxed);
        self.inner.api_latency_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_detection(&self, duration: Duration, regions: usize) {
        self.inner.pages_detected.fetch_add(1, Ordering::Relaxed);
        self.inner.regions_detected.fetch_add(regions, Ordering::Relaxed);
        self.inner.detection_duration_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_batch_finished(&self, state: BatchState, completed: usize, failed: usize) {
        self.inner
            .batch_outcomes
            .entry(state.as_str())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.inner.items_completed.fetch_add(completed, Ordering::Relaxed);
        self.inner.items_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_charge(&self, counter: UsageCounter, count: u32) {
        self.inner
            .quota_charged
            .entry(counter.as_str())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_quota_refund(&self, counter: UsageCounter, count: u32) {
        self.inner
            .quota_refunded
            .entry(counter.as_str())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_refund_failure(&self) {
        self.inner.refund_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.inner.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let api_latency = self.inner.api_latency_ms.read();
        let api_latency_avg_ms = avg(&api_latency);
        let api_latency_p50_ms = percentile(&api_latency, 0.5);
        let api_latency_p95_ms = percentile(&api_latency, 0.95);
        drop(api_latency);

        let detection_avg_ms = avg(&self.inner.detection_duration_ms.read());

        let outcome = |state: BatchState| {
            self.inner
                .batch_outcomes
                .get(state.as_str())
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0)
        };
        let per_counter = |map: &DashMap<&'static str, AtomicU64>| {
            UsageCounter::ALL
                .iter()
                .map(|counter| {
                    let value = map
                        .get(counter.as_str())
                        .map(|c| c.load(Ordering::Relaxed))
                        .unwrap_or(0);
                    (counter.as_str().to_string(), value)
                })
                .collect::<Vec<_>>()
        };

        MetricsSnapshot {
            api_calls_total: self.inner.api_calls_total.load(Ordering::Relaxed),
            api_calls_success: self.inner.api_calls_success.load(Ordering::Relaxed),
            api_calls_failed: self.inner.api_calls_failed.load(Ordering::Relaxed),
            api_tokens_input: self.inner.api_tokens_input.load(Ordering::Relaxed),
            api_tokens_output: self.inner.api_tokens_output.load(Ordering::Relaxed),
            api_latency_avg_ms,
            api_latency_p50_ms,
            api_latency_p95_ms,
            pages_detected: self.inner.pages_detected.load(Ordering::Relaxed),
            regions_detected: self.inner.regions_detected.load(Ordering::Relaxed),
            detection_avg_ms,
            batches_completed: outcome(BatchState::Completed),
            batches_cancelled: outcome(BatchState::Cancelled),
            batches_failed: outcome(BatchState::Failed),
            items_completed: self.inner.items_completed.load(Ordering::Relaxed),
            items_failed: self.inner.items_failed.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            quota_charged: per_counter(&self.inner.quota_charged),
            quota_refunded: per_counter(&self.inner.quota_refunded),
            refund_failures: self.inner.refund_failures.load(Ordering::Relaxed),
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            r#"# HELP api_calls_total Total number of LLM API calls made
# TYPE api_calls_total counter
api_calls_total {{}} {}

# HELP api_calls_failed Number of failed LLM API calls
# TYPE api_calls_failed counter
api_calls_failed {{}} {}

# HELP api_tokens_input_total Total input tokens consumed
# TYPE api_tokens_input_total counter
api_tokens_input_total {{}} {}

# HELP api_tokens_output_total Total output tokens generated
# TYPE api_tokens_output_total counter
api_tokens_output_total {{}} {}

# HELP api_latency_avg_ms Average API latency in milliseconds
# TYPE api_latency_avg_ms gauge
api_latency_avg_ms {{}} {}

# HELP regions_detected_total Problem regions found by the detector
# TYPE regions_detected_total counter
regions_detected_total {{}} {}

# HELP detection_avg_duration_ms Average detection pass duration
# TYPE detection_avg_duration_ms gauge
detection_avg_duration_ms {{}} {}

# HELP batches_total Finished batches by terminal state
# TYPE batches_total counter
batches_total {{state="completed"}} {}
batches_total {{state="cancelled"}} {}
batches_total {{state="failed"}} {}

# HELP explanation_items_total Explanation items by result
# TYPE explanation_items_total counter
explanation_items_total {{result="completed"}} {}
explanation_items_total {{result="failed"}} {}

# HELP quota_refund_failures_total Refunds that could not be applied
# TYPE quota_refund_failures_total counter
quota_refund_failures_total {{}} {}

# HELP circuit_breaker_trips_total Total circuit breaker trips
# TYPE circuit_breaker_trips_total counter
circuit_breaker_trips_total {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            s.api_calls_total,
            s.api_calls_failed,
            s.api_tokens_input,
            s.api_tokens_output,
            s.api_latency_avg_ms,
            s.regions_detected,
            s.detection_avg_ms,
            s.batches_completed,
            s.batches_cancelled,
            s.batches_failed,
            s.items_completed,
            s.items_failed,
            s.refund_failures,
            s.circuit_breaker_trips,
            s.uptime_seconds,
        );

        out.push_str("\n# HELP quota_charged_total Quota units charged by counter\n# TYPE quota_charged_total counter\n");
        for (counter, value) in &s.quota_charged {
            out.push_str(&format!("quota_charged_total {{counter=\"{}\"}} {}\n", counter, value));
        }
        out.push_str("\n# HELP quota_refunded_total Quota units refunded by counter\n# TYPE quota_refunded_total counter\n");
        for (counter, value) in &s.quota_refunded {
            out.push_str(&format!("quota_refunded_total {{counter=\"{}\"}} {}\n", counter, value));
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub api_calls_total: usize,
    pub api_calls_success: usize,
    pub api_calls_failed: usize,
    pub api_tokens_input: u64,
    pub api_tokens_output: u64,
    pub api_latency_avg_ms: u64,
    pub api_latency_p50_ms: u64,
    pub api_latency_p95_ms: u64,
    pub pages_detected: usize,
    pub regions_detected: usize,
    pub detection_avg_ms: u64,
    pub batches_completed: usize,
    pub batches_cancelled: usize,
    pub batches_failed: usize,
    pub items_completed: usize,
    pub items_failed: usize,
    pub retries: usize,
    pub quota_charged: Vec<(String, u64)>,
    pub quota_refunded: Vec<(String, u64)>,
    pub refund_failures: usize,
    pub circuit_breaker_trips: usize,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}
