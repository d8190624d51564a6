//! Batch generation integration tests.
//!
//! Drives the orchestrator with scripted generators and quota stores to check
//! charging, partial failure, cancellation, refunds and per-record retry.

use async_trait::async_trait;
use haejeok::core::config::{BatchConfig, DetectionConfig, QuotaConfig, TierLimits};
use haejeok::core::errors::{ApiError, ApiResult, BatchError, QuotaError, QuotaResult};
use haejeok::core::types::{
    AnalyzedProblem, Bbox, DetectedProblem, Explanation, ExplanationMode, ExplanationRequest,
    ProblemType, Rect, UsageCounter, UsageTier,
};
use haejeok::orchestration::{
    BatchEvent, BatchOrchestrator, BatchState, EventSink, GenerateRequest,
};
use haejeok::services::detection::RegionDetector;
use haejeok::services::llm::{ExplanationGenerator, RegionRecognizer};
use haejeok::services::quota::{ChargeOutcome, InMemoryQuotaStore, QuotaLedger, QuotaStore};
use image::DynamicImage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

const USER: &str = "student-1";

/// Generator whose n-th call (1-based) can fail, hang, or fire a cancellation token
#[derive(Default)]
struct ScriptedGenerator {
    calls: AtomicUsize,
    fail_on: Vec<usize>,
    hang_on: Vec<usize>,
    cancel_on: Option<(usize, CancellationToken)>,
}

impl ScriptedGenerator {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExplanationGenerator for ScriptedGenerator {
    async fn generate(&self, request: &ExplanationRequest) -> ApiResult<Explanation> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, token)) = &self.cancel_on {
            if n == *at {
                token.cancel();
            }
        }
        if self.hang_on.contains(&n) {
            std::future::pending::<()>().await;
        }
        if self.fail_on.contains(&n) {
            return Err(ApiError::other("model refused the request"));
        }
        Ok(Explanation {
            markdown: format!("## 풀이 {}\n{}", n, request.problem_text),
            core_concepts: vec!["연산".to_string()],
            difficulty: Some(2),
        })
    }
}

/// Generator that never answers until the call is abandoned
#[derive(Default)]
struct HangingGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl ExplanationGenerator for HangingGenerator {
    async fn generate(&self, _request: &ExplanationRequest) -> ApiResult<Explanation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

struct UnusedRecognizer;

#[async_trait]
impl RegionRecognizer for UnusedRecognizer {
    async fn recognize(&self, _page: &DynamicImage, _bbox: Bbox) -> ApiResult<DetectedProblem> {
        Err(ApiError::other("recognizer is not used in these tests"))
    }
}

/// Store whose refunds always fail
#[derive(Default)]
struct RefundFailingStore {
    inner: InMemoryQuotaStore,
}

#[async_trait]
impl QuotaStore for RefundFailingStore {
    async fn used(&self, user_id: &str, counter: UsageCounter, period: &str) -> QuotaResult<u32> {
        self.inner.used(user_id, counter, period).await
    }

    async fn try_charge(
        &self,
        user_id: &str,
        counter: UsageCounter,
        period: &str,
        count: u32,
        limit: u32,
    ) -> QuotaResult<ChargeOutcome> {
        self.inner.try_charge(user_id, counter, period, count, limit).await
    }

    async fn refund(&self, _: &str, _: UsageCounter, _: &str, _: u32) -> QuotaResult<u32> {
        Err(QuotaError::StoreUnavailable("connection reset".to_string()))
    }
}

fn quota_config(fast_limit: u32) -> QuotaConfig {
    let mut config = QuotaConfig::default();
    config.tiers.insert(
        UsageTier::Free,
        TierLimits {
            fast: fast_limit,
            standard: 5,
            quality: 2,
            export: 3,
        },
    );
    config
}

fn batch_config() -> BatchConfig {
    BatchConfig {
        max_attempts: 3,
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(5),
        generation_timeout: Duration::from_secs(5),
        recognition_timeout: Duration::from_secs(5),
    }
}

fn orchestrator(
    generator: Arc<dyn ExplanationGenerator>,
    store: Arc<dyn QuotaStore>,
    fast_limit: u32,
) -> Arc<BatchOrchestrator> {
    let ledger = Arc::new(QuotaLedger::new(store, quota_config(fast_limit), None));
    Arc::new(BatchOrchestrator::new(
        Arc::new(RegionDetector::new(DetectionConfig::default(), None)),
        Arc::new(UnusedRecognizer),
        generator,
        ledger,
        &batch_config(),
        None,
    ))
}

fn problems(n: usize) -> Vec<AnalyzedProblem> {
    (0..n)
        .map(|i| AnalyzedProblem {
            page_number: 1,
            problem: DetectedProblem {
                bbox: Rect::new(0, (i * 100) as u32, 500, 80).normalize(1000, 2000),
                problem_type: ProblemType::FreeResponse,
                problem_body: format!("{} + {} = ?", i, i),
                choices: None,
            },
            image: None,
        })
        .collect()
}

fn request(n: usize) -> GenerateRequest {
    GenerateRequest {
        user_id: USER.to_string(),
        tier: UsageTier::Free,
        mode: ExplanationMode::Fast,
        problems: problems(n),
        batch_id: None,
    }
}

fn event_channel() -> (EventSink, UnboundedReceiver<BatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink::new(tx), rx)
}

fn drain(rx: &mut UnboundedReceiver<BatchEvent>) -> Vec<BatchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn fast_used(orchestrator: &BatchOrchestrator) -> u32 {
    orchestrator
        .usage(USER, UsageTier::Free)
        .await
        .unwrap()
        .counters
        .iter()
        .find(|c| c.counter == UsageCounter::Fast)
        .map(|c| c.used)
        .unwrap()
}

#[tokio::test]
async fn test_insufficient_quota_charges_nothing_and_creates_no_records() {
    let generator = Arc::new(ScriptedGenerator::default());
    let orchestrator = orchestrator(generator.clone(), Arc::new(InMemoryQuotaStore::new()), 3);
    let (sink, mut rx) = event_channel();

    let err = orchestrator
        .generate(request(5), CancellationToken::new(), sink)
        .await
        .unwrap_err();

    match err {
        BatchError::QuotaExceeded {
            requested,
            remaining,
            ..
        } => {
            assert_eq!(requested, 5);
            assert_eq!(remaining, 3);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(orchestrator.records(USER).is_empty());
    assert_eq!(fast_used(&orchestrator).await, 0);
    assert_eq!(generator.calls(), 0);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .all(|e| !matches!(e, BatchEvent::RecordCreated(_))));
    assert!(events.iter().any(|e| matches!(
        e,
        BatchEvent::StateChanged {
            to: BatchState::Failed,
            ..
        }
    )));
    assert!(!orchestrator.has_active_batch(USER));
}

#[tokio::test]
async fn test_single_item_failure_is_refunded_and_batch_completes() {
    let generator = Arc::new(ScriptedGenerator {
        fail_on: vec![3],
        ..Default::default()
    });
    let orchestrator = orchestrator(generator.clone(), Arc::new(InMemoryQuotaStore::new()), 10);
    let (sink, mut rx) = event_channel();

    let outcome = orchestrator
        .generate(request(4), CancellationToken::new(), sink)
        .await
        .unwrap();

    assert_eq!(outcome.state, BatchState::Completed);
    assert_eq!(outcome.requested, 4);
    assert_eq!(outcome.completed, 3);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.refunded, 1);
    assert!(outcome.quota_warning.is_none());

    assert_eq!(outcome.records.len(), 4);
    assert!(outcome.records.iter().all(|r| !r.is_loading));
    let failed: Vec<_> = outcome.records.iter().filter(|r| r.is_error).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].problem_number, 3);
    assert!(failed[0].error_message.is_some());

    // Non-retryable failure: one call per item
    assert_eq!(generator.calls(), 4);
    assert_eq!(fast_used(&orchestrator).await, 3);

    let events = drain(&mut rx);
    let created = events
        .iter()
        .filter(|e| matches!(e, BatchEvent::RecordCreated(_)))
        .count();
    let updated = events
        .iter()
        .filter(|e| matches!(e, BatchEvent::RecordUpdated(_)))
        .count();
    assert_eq!(created, 4);
    assert_eq!(updated, 4);
}

#[tokio::test]
async fn test_cancel_after_fourth_item_refunds_the_rest() {
    let token = CancellationToken::new();
    let generator = Arc::new(ScriptedGenerator {
        cancel_on: Some((4, token.clone())),
        ..Default::default()
    });
    let orchestrator = orchestrator(generator.clone(), Arc::new(InMemoryQuotaStore::new()), 20);
    let (sink, mut rx) = event_channel();

    let outcome = orchestrator.generate(request(10), token, sink).await.unwrap();

    assert_eq!(outcome.state, BatchState::Cancelled);
    assert_eq!(outcome.completed, 4);
    assert_eq!(outcome.refunded, 6);
    assert_eq!(outcome.records.len(), 4);
    assert!(outcome.records.iter().all(|r| r.is_success()));
    assert_eq!(fast_used(&orchestrator).await, 4);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(generator.calls(), 4);

    let dropped = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, BatchEvent::RecordDropped { .. }))
        .count();
    assert_eq!(dropped, 6);
    assert_eq!(orchestrator.records(USER).len(), 4);
}

/// Polls until a refund issued on a spawned task has landed
async fn settle_usage(orchestrator: &BatchOrchestrator, expected: u32) -> u32 {
    for _ in 0..200 {
        if fast_used(orchestrator).await == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    fast_used(orchestrator).await
}

#[tokio::test]
async fn test_abandoned_batch_releases_quota_and_placeholders() {
    let generator = Arc::new(HangingGenerator::default());
    let orchestrator = orchestrator(generator.clone(), Arc::new(InMemoryQuotaStore::new()), 10);
    let (sink, mut rx) = event_channel();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        orchestrator.generate(request(3), CancellationToken::new(), sink),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    assert_eq!(settle_usage(&orchestrator, 0).await, 0);
    assert!(orchestrator.records(USER).is_empty());
    assert!(matches!(
        orchestrator.delete_record(USER, 1),
        Err(BatchError::RecordNotFound(1))
    ));
    assert!(!orchestrator.has_active_batch(USER));

    let dropped = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, BatchEvent::RecordDropped { .. }))
        .count();
    assert_eq!(dropped, 3);
}

#[tokio::test]
async fn test_abandoned_batch_keeps_finished_items_charged() {
    let generator = Arc::new(ScriptedGenerator {
        hang_on: vec![3],
        ..Default::default()
    });
    let orchestrator = orchestrator(generator.clone(), Arc::new(InMemoryQuotaStore::new()), 10);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        orchestrator.generate(request(4), CancellationToken::new(), EventSink::disabled()),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(generator.calls(), 3);

    assert_eq!(settle_usage(&orchestrator, 2).await, 2);
    let records = orchestrator.records(USER);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.is_success()));
}

#[tokio::test]
async fn test_abandoned_retry_restores_record() {
    let generator = Arc::new(ScriptedGenerator {
        fail_on: vec![2],
        hang_on: vec![3],
        ..Default::default()
    });
    let orchestrator = orchestrator(generator.clone(), Arc::new(InMemoryQuotaStore::new()), 10);
    let outcome = orchestrator
        .generate(request(2), CancellationToken::new(), EventSink::disabled())
        .await
        .unwrap();
    let failed = outcome.records.iter().find(|r| r.is_error).unwrap().clone();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        orchestrator.retry_record(USER, failed.id, &CancellationToken::new()),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(generator.calls(), 3);

    let stored = orchestrator
        .records(USER)
        .into_iter()
        .find(|r| r.id == failed.id)
        .unwrap();
    assert_eq!(stored, failed);
    assert!(!stored.is_loading);
    assert!(orchestrator.delete_record(USER, failed.id).is_ok());
    assert_eq!(fast_used(&orchestrator).await, 1);
}

#[tokio::test]
async fn test_resuming_unknown_batch_is_rejected() {
    let generator = Arc::new(ScriptedGenerator::default());
    let orchestrator = orchestrator(generator.clone(), Arc::new(InMemoryQuotaStore::new()), 10);

    for _ in 0..2 {
        let mut resumed = request(2);
        resumed.batch_id = Some("never-started".to_string());
        let err = orchestrator
            .generate(resumed, CancellationToken::new(), EventSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::NotAwaitingSelection(ref id) if id == "never-started"));
    }

    assert_eq!(generator.calls(), 0);
    assert_eq!(fast_used(&orchestrator).await, 0);
    assert!(orchestrator.records(USER).is_empty());
    assert!(!orchestrator.has_active_batch(USER));
}

#[tokio::test]
async fn test_cancel_after_last_item_still_completes() {
    let token = CancellationToken::new();
    let generator = Arc::new(ScriptedGenerator {
        cancel_on: Some((3, token.clone())),
        ..Default::default()
    });
    let orchestrator = orchestrator(generator, Arc::new(InMemoryQuotaStore::new()), 10);

    let outcome = orchestrator.generate(request(3), token, EventSink::disabled()).await.unwrap();

    assert_eq!(outcome.state, BatchState::Completed);
    assert_eq!(outcome.completed, 3);
    assert_eq!(outcome.refunded, 0);
    assert_eq!(outcome.records.len(), 3);
    assert_eq!(fast_used(&orchestrator).await, 3);
}

#[tokio::test]
async fn test_charged_equals_completed_plus_refunded() {
    for fail_on in [vec![], vec![1], vec![2, 4], vec![1, 2, 3, 4, 5]] {
        let generator = Arc::new(ScriptedGenerator {
            fail_on,
            ..Default::default()
        });
        let orchestrator = orchestrator(generator, Arc::new(InMemoryQuotaStore::new()), 10);
        let outcome = orchestrator
            .generate(request(5), CancellationToken::new(), EventSink::disabled())
            .await
            .unwrap();

        assert_eq!(outcome.requested, outcome.completed + outcome.refunded);
        assert_eq!(fast_used(&orchestrator).await, outcome.completed);
    }
}

#[tokio::test]
async fn test_refund_failure_surfaces_warning() {
    let generator = Arc::new(ScriptedGenerator {
        fail_on: vec![2],
        ..Default::default()
    });
    let orchestrator = orchestrator(generator, Arc::new(RefundFailingStore::default()), 10);
    let (sink, mut rx) = event_channel();

    let outcome = orchestrator
        .generate(request(3), CancellationToken::new(), sink)
        .await
        .unwrap();

    assert_eq!(outcome.state, BatchState::Completed);
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.refunded, 0);
    let warning = outcome.quota_warning.expect("warning expected");
    assert!(warning.contains("verify"));

    let reconciliation: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            BatchEvent::QuotaReconciliationFailed { count, counter, .. } => Some((count, counter)),
            _ => None,
        })
        .collect();
    assert_eq!(reconciliation, vec![(1, UsageCounter::Fast)]);
}

#[tokio::test]
async fn test_retry_never_touches_quota() {
    let generator = Arc::new(ScriptedGenerator {
        fail_on: vec![2],
        ..Default::default()
    });
    let orchestrator = orchestrator(generator.clone(), Arc::new(InMemoryQuotaStore::new()), 10);
    let outcome = orchestrator
        .generate(request(2), CancellationToken::new(), EventSink::disabled())
        .await
        .unwrap();
    let failed = outcome.records.iter().find(|r| r.is_error).unwrap().clone();
    assert_eq!(fast_used(&orchestrator).await, 1);

    let retried = orchestrator
        .retry_record(USER, failed.id, &CancellationToken::new())
        .await
        .unwrap();

    assert!(retried.is_success());
    assert!(retried.error_message.is_none());
    assert!(retried.markdown.contains("1 + 1 = ?"));
    assert_eq!(generator.calls(), 3);
    assert_eq!(fast_used(&orchestrator).await, 1);

    let stored = orchestrator
        .records(USER)
        .into_iter()
        .find(|r| r.id == failed.id)
        .unwrap();
    assert_eq!(stored, retried);
}

#[tokio::test]
async fn test_retry_and_delete_unknown_record() {
    let orchestrator = orchestrator(
        Arc::new(ScriptedGenerator::default()),
        Arc::new(InMemoryQuotaStore::new()),
        10,
    );
    let err = orchestrator
        .retry_record(USER, 999, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::RecordNotFound(999)));
    assert!(matches!(
        orchestrator.delete_record(USER, 999),
        Err(BatchError::RecordNotFound(999))
    ));
}

#[tokio::test]
async fn test_delete_record_removes_it() {
    let orchestrator = orchestrator(
        Arc::new(ScriptedGenerator::default()),
        Arc::new(InMemoryQuotaStore::new()),
        10,
    );
    let outcome = orchestrator
        .generate(request(2), CancellationToken::new(), EventSink::disabled())
        .await
        .unwrap();
    let id = outcome.records[0].id;

    let deleted = orchestrator.delete_record(USER, id).unwrap();
    assert_eq!(deleted.id, id);
    let remaining = orchestrator.records(USER);
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].id, id);
}

#[tokio::test]
async fn test_second_batch_rejected_and_in_flight_item_refunded_on_cancel() {
    let generator = Arc::new(HangingGenerator::default());
    let orchestrator = orchestrator(generator.clone(), Arc::new(InMemoryQuotaStore::new()), 10);

    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .generate(request(3), CancellationToken::new(), EventSink::disabled())
                .await
        })
    };

    while generator.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    assert!(orchestrator.has_active_batch(USER));

    let err = orchestrator
        .generate(request(1), CancellationToken::new(), EventSink::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::BatchInProgress(_)));

    assert!(orchestrator.cancel_active(USER));
    let outcome = running.await.unwrap().unwrap();

    assert_eq!(outcome.state, BatchState::Cancelled);
    assert_eq!(outcome.completed, 0);
    assert_eq!(outcome.refunded, 3);
    assert!(outcome.records.is_empty());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fast_used(&orchestrator).await, 0);
    assert!(!orchestrator.has_active_batch(USER));
}

#[tokio::test]
async fn test_cancelled_before_charging_charges_nothing() {
    let generator = Arc::new(ScriptedGenerator::default());
    let orchestrator = orchestrator(generator.clone(), Arc::new(InMemoryQuotaStore::new()), 10);
    let token = CancellationToken::new();
    token.cancel();

    let outcome = orchestrator
        .generate(request(3), token, EventSink::disabled())
        .await
        .unwrap();

    assert_eq!(outcome.state, BatchState::Cancelled);
    assert_eq!(outcome.requested, 0);
    assert_eq!(generator.calls(), 0);
    assert_eq!(fast_used(&orchestrator).await, 0);
}

#[tokio::test]
async fn test_empty_batch_is_rejected() {
    let orchestrator = orchestrator(
        Arc::new(ScriptedGenerator::default()),
        Arc::new(InMemoryQuotaStore::new()),
        10,
    );
    let err = orchestrator
        .generate(request(0), CancellationToken::new(), EventSink::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::EmptyBatch));
}

#[tokio::test]
async fn test_export_quota_is_charged_monthly() {
    let orchestrator = orchestrator(
        Arc::new(ScriptedGenerator::default()),
        Arc::new(InMemoryQuotaStore::new()),
        10,
    );
    let receipt = orchestrator.charge_export(USER, UsageTier::Free, 2).await.unwrap();
    assert_eq!(receipt.counter, UsageCounter::Export);
    assert_eq!(receipt.period.len(), "2026-10".len());

    let err = orchestrator
        .charge_export(USER, UsageTier::Free, 2)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BatchError::ExportQuotaExceeded {
            requested: 2,
            remaining: 1
        }
    ));
}
