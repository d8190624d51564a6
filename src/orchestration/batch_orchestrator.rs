// Batch Orchestrator: region analysis, up-front charging, sequential generation and refunds

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::events::{BatchEvent, EventSink};
use super::state::BatchState;
use crate::core::config::BatchConfig;
use crate::core::errors::{ApiError, BatchError, BatchResult};
use crate::core::types::{
    AnalyzedProblem, ChargeReceipt, Explanation, ExplanationMode, ExplanationRecord,
    ExplanationRequest, PageInput, UsageSnapshot, UsageTier,
};
use crate::middleware::retry::{Attempt, RetryPolicy};
use crate::services::detection::RegionDetector;
use crate::services::llm::{ExplanationGenerator, RegionRecognizer};
use crate::services::quota::QuotaLedger;
use crate::utils::{crop_bbox_png_async, png_data_url, Metrics};

/// Pages to analyze and how to explain what is found
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub user_id: String,
    pub tier: UsageTier,
    pub mode: ExplanationMode,
    pub pages: Vec<PageInput>,
    /// Stop after analysis so the user can pick which problems to explain
    pub manual_selection: bool,
}

/// Confirmed problems to explain
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub user_id: String,
    #[serde(default)]
    pub tier: UsageTier,
    pub mode: ExplanationMode,
    pub problems: Vec<AnalyzedProblem>,
    /// Batch left in `AwaitingUserSelection` by `start_batch`, if any
    #[serde(default)]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub pages: u32,
    pub regions_detected: usize,
    /// Regions dropped because recognition failed; never charged
    pub recognition_failures: usize,
    pub problems: Vec<AnalyzedProblem>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub batch_id: String,
    pub state: BatchState,
    pub mode: ExplanationMode,
    pub requested: u32,
    pub completed: u32,
    pub failed: u32,
    pub refunded: u32,
    pub records: Vec<ExplanationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisReport>,
}

impl BatchOutcome {
    fn empty(run: &BatchRun, mode: ExplanationMode) -> Self {
        Self {
            batch_id: run.batch_id.clone(),
            state: run.state,
            mode,
            requested: 0,
            completed: 0,
            failed: 0,
            refunded: 0,
            records: Vec::new(),
            quota_warning: None,
            analysis: None,
        }
    }
}

/// State machine of one running batch
struct BatchRun {
    batch_id: String,
    state: BatchState,
    events: EventSink,
}

impl BatchRun {
    fn new(events: EventSink) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            state: BatchState::Idle,
            events,
        }
    }

    /// Continue a batch that stopped for user selection
    fn resume(batch_id: String, events: EventSink) -> Self {
        Self {
            batch_id,
            state: BatchState::AwaitingUserSelection,
            events,
        }
    }

    fn transition(&mut self, to: BatchState) -> BatchResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(BatchError::InvalidTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        debug!("Batch {}: {} -> {}", self.batch_id, self.state, to);
        self.events.emit(BatchEvent::StateChanged {
            batch_id: self.batch_id.clone(),
            from: self.state,
            to,
        });
        self.state = to;
        Ok(())
    }

    /// Transition once quota is held; a refused transition is logged, never propagated
    fn settle(&mut self, to: BatchState) {
        if let Err(e) = self.transition(to) {
            error!("Batch {}: {}", self.batch_id, e);
        }
    }
}

struct ActiveBatch {
    batch_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct UserSession {
    records: Vec<ExplanationRecord>,
    active: Option<ActiveBatch>,
    /// Batches stopped for problem selection; each id resumes at most once
    awaiting_selection: HashSet<String>,
}

/// Clears the user's active batch slot when the batch ends
struct ActiveBatchGuard {
    session: Arc<Mutex<UserSession>>,
    batch_id: String,
}

impl Drop for ActiveBatchGuard {
    fn drop(&mut self) {
        let mut session = self.session.lock();
        if session
            .active
            .as_ref()
            .is_some_and(|a| a.batch_id == self.batch_id)
        {
            session.active = None;
        }
    }
}

/// Quota and placeholders a charged batch holds until it settles.
///
/// Settling removes placeholders that were never reached and refunds every
/// unfinished item once. Dropping an unsettled value (the batch future was
/// abandoned mid-flight) does the same, with the refund on a spawned task.
struct Settlement {
    ledger: Arc<QuotaLedger>,
    session: Arc<Mutex<UserSession>>,
    receipt: ChargeReceipt,
    batch_id: String,
    events: EventSink,
    metrics: Option<Metrics>,
    /// Placeholder ids in processing order
    record_ids: Vec<u64>,
    /// Items whose call finished, successfully or not
    reached: usize,
    completed: u32,
    settled: bool,
}

impl Settlement {
    fn unfinished(&self) -> u32 {
        self.receipt.count.saturating_sub(self.completed)
    }

    fn drop_unreached(&self) {
        let unreached = &self.record_ids[self.reached.min(self.record_ids.len())..];
        if unreached.is_empty() {
            return;
        }
        info!(
            "Batch {} stopped after {} of {} items",
            self.batch_id,
            self.reached,
            self.record_ids.len()
        );
        self.session
            .lock()
            .records
            .retain(|r| !unreached.contains(&r.id));
        for &record_id in unreached {
            self.events.emit(BatchEvent::RecordDropped {
                batch_id: self.batch_id.clone(),
                record_id,
            });
        }
    }

    /// Returns the refunded count and a warning when the refund failed
    async fn settle(mut self) -> (u32, Option<String>) {
        self.settled = true;
        self.drop_unreached();
        refund_unfinished(
            &self.ledger,
            &self.receipt,
            self.unfinished(),
            &self.batch_id,
            &self.events,
        )
        .await
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(
            "Batch {} abandoned after {} of {} items",
            self.batch_id,
            self.reached,
            self.record_ids.len()
        );
        self.drop_unreached();
        if let Some(ref m) = self.metrics {
            let failed = self.reached.saturating_sub(self.completed as usize);
            m.record_batch_finished(BatchState::Cancelled, self.completed as usize, failed);
        }

        let count = self.unfinished();
        if count == 0 {
            return;
        }
        let ledger = Arc::clone(&self.ledger);
        let receipt = self.receipt.clone();
        let batch_id = self.batch_id.clone();
        let events = self.events.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    refund_unfinished(&ledger, &receipt, count, &batch_id, &events).await;
                });
            }
            Err(_) => error!(
                "Batch {}: no runtime left to refund {} {} for {}",
                batch_id, count, receipt.counter, receipt.user_id
            ),
        }
    }
}

/// Refund once; a failed refund is surfaced, not retried
async fn refund_unfinished(
    ledger: &QuotaLedger,
    receipt: &ChargeReceipt,
    count: u32,
    batch_id: &str,
    events: &EventSink,
) -> (u32, Option<String>) {
    if count == 0 {
        return (0, None);
    }
    match ledger.refund(receipt, count).await {
        Ok(()) => (count, None),
        Err(e) => {
            error!(
                "Batch {}: refund of {} {} for {} failed: {}",
                batch_id, count, receipt.counter, receipt.user_id, e
            );
            events.emit(BatchEvent::QuotaReconciliationFailed {
                batch_id: batch_id.to_string(),
                user_id: receipt.user_id.clone(),
                counter: receipt.counter,
                period: receipt.period.clone(),
                count,
                message: e.to_string(),
            });
            (
                0,
                Some(format!(
                    "Usage for {} unfinished {} explanation(s) could not be restored. \
                     Refresh and verify your remaining usage.",
                    count, receipt.counter
                )),
            )
        }
    }
}

/// Puts a record back as it was when a retry is abandoned mid-call
struct RetryRestore {
    session: Arc<Mutex<UserSession>>,
    previous: Option<ExplanationRecord>,
}

impl RetryRestore {
    fn disarm(mut self) {
        self.previous = None;
    }
}

impl Drop for RetryRestore {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let record_id = previous.id;
            update_record(&self.session, record_id, |r| *r = previous);
        }
    }
}

/// Main batch orchestrator
pub struct BatchOrchestrator {
    detector: Arc<RegionDetector>,
    recognizer: Arc<dyn RegionRecognizer>,
    generator: Arc<dyn ExplanationGenerator>,
    ledger: Arc<QuotaLedger>,
    recognition_policy: RetryPolicy,
    generation_policy: RetryPolicy,
    sessions: DashMap<String, Arc<Mutex<UserSession>>>,
    next_record_id: AtomicU64,
    metrics: Option<Metrics>,
}

impl BatchOrchestrator {
    pub fn new(
        detector: Arc<RegionDetector>,
        recognizer: Arc<dyn RegionRecognizer>,
        generator: Arc<dyn ExplanationGenerator>,
        ledger: Arc<QuotaLedger>,
        batch_config: &BatchConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        let mut recognition_policy = RetryPolicy::for_recognition(batch_config);
        let mut generation_policy = RetryPolicy::for_generation(batch_config);
        if let Some(ref m) = metrics {
            recognition_policy = recognition_policy.with_metrics(m.clone());
            generation_policy = generation_policy.with_metrics(m.clone());
        }

        Self {
            detector,
            recognizer,
            generator,
            ledger,
            recognition_policy,
            generation_policy,
            sessions: DashMap::new(),
            next_record_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn detector(&self) -> &RegionDetector {
        &self.detector
    }

    fn session(&self, user_id: &str) -> Arc<Mutex<UserSession>> {
        Arc::clone(&self.sessions.entry(user_id.to_string()).or_default())
    }

    fn begin(&self, user_id: &str, batch_id: &str, cancel: &CancellationToken) -> BatchResult<ActiveBatchGuard> {
        let session = self.session(user_id);
        {
            let mut s = session.lock();
            if let Some(ref active) = s.active {
                warn!("User {} already runs batch {}", user_id, active.batch_id);
                return Err(BatchError::BatchInProgress(user_id.to_string()));
            }
            s.active = Some(ActiveBatch {
                batch_id: batch_id.to_string(),
                cancel: cancel.clone(),
            });
        }
        Ok(ActiveBatchGuard {
            session,
            batch_id: batch_id.to_string(),
        })
    }

    fn record_finished(&self, state: BatchState, completed: u32, failed: u32) {
        if let Some(ref m) = self.metrics {
            m.record_batch_finished(state, completed as usize, failed as usize);
        }
    }

    /// Analyze pages and, unless manual selection was asked for, explain every
    /// recognized problem.
    #[instrument(skip(self, request, cancel, events), fields(user_id = %request.user_id, pages = request.pages.len(), mode = %request.mode))]
    pub async fn start_batch(
        &self,
        request: BatchRequest,
        cancel: CancellationToken,
        events: EventSink,
    ) -> BatchResult<BatchOutcome> {
        let mut run = BatchRun::new(events);
        let _guard = self.begin(&request.user_id, &run.batch_id, &cancel)?;
        info!("Batch {} started ({} pages)", run.batch_id, request.pages.len());

        run.transition(BatchState::AnalyzingRegions)?;
        let report = match self
            .analyze(&run.batch_id, &request.pages, &cancel, &run.events)
            .await
        {
            Ok(Attempt::Finished(report)) => report,
            Ok(Attempt::Cancelled) => {
                info!("Batch {} cancelled during analysis", run.batch_id);
                run.transition(BatchState::Cancelled)?;
                self.record_finished(BatchState::Cancelled, 0, 0);
                return Ok(BatchOutcome::empty(&run, request.mode));
            }
            Err(e) => {
                error!("Batch {} failed during analysis: {}", run.batch_id, e);
                run.transition(BatchState::Failed)?;
                self.record_finished(BatchState::Failed, 0, 0);
                return Err(e);
            }
        };

        if request.manual_selection {
            run.transition(BatchState::AwaitingUserSelection)?;
            self.session(&request.user_id)
                .lock()
                .awaiting_selection
                .insert(run.batch_id.clone());
            let mut outcome = BatchOutcome::empty(&run, request.mode);
            outcome.analysis = Some(report);
            return Ok(outcome);
        }

        if report.problems.is_empty() {
            info!("Batch {} found no problems to explain", run.batch_id);
            run.transition(BatchState::Completed)?;
            self.record_finished(BatchState::Completed, 0, 0);
            let mut outcome = BatchOutcome::empty(&run, request.mode);
            outcome.analysis = Some(report);
            return Ok(outcome);
        }

        let problems = report.problems.clone();
        let mut outcome = self
            .generate_in(
                &mut run,
                &request.user_id,
                request.tier,
                request.mode,
                problems,
                &cancel,
            )
            .await?;
        outcome.analysis = Some(report);
        Ok(outcome)
    }

    /// Detect and recognize the problems on each page.
    ///
    /// An undecodable page fails the whole analysis. A region whose recognition
    /// fails is dropped and counted.
    #[instrument(skip(self, pages, cancel, events), fields(pages = pages.len()))]
    pub async fn analyze(
        &self,
        batch_id: &str,
        pages: &[PageInput],
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> BatchResult<Attempt<AnalysisReport>> {
        let mut report = AnalysisReport::default();

        for page in pages {
            if cancel.is_cancelled() {
                return Ok(Attempt::Cancelled);
            }

            let (image, regions) = self
                .detector
                .detect_bytes(&page.image_bytes)
                .await
                .map_err(|source| BatchError::PageFailed {
                    page_number: page.page_number,
                    source,
                })?;
            debug!("Page {}: {} regions", page.page_number, regions.len());
            report.pages += 1;
            report.regions_detected += regions.len();
            events.emit(BatchEvent::RegionsDetected {
                batch_id: batch_id.to_string(),
                page_number: page.page_number,
                regions: regions.clone(),
            });

            for bbox in regions {
                if cancel.is_cancelled() {
                    return Ok(Attempt::Cancelled);
                }

                let recognizer = &self.recognizer;
                let page_image = &image;
                let attempt = self
                    .recognition_policy
                    .run(cancel, || recognizer.recognize(page_image, bbox))
                    .await;

                match attempt {
                    Attempt::Finished(Ok(problem)) => {
                        let image_url = match crop_bbox_png_async(Arc::clone(&image), bbox).await {
                            Ok(png) => Some(png_data_url(&png)),
                            Err(e) => {
                                warn!("Page {}: could not crop region preview: {}", page.page_number, e);
                                None
                            }
                        };
                        report.problems.push(AnalyzedProblem {
                            page_number: page.page_number,
                            problem,
                            image: image_url,
                        });
                    }
                    Attempt::Finished(Err(e)) => {
                        warn!(
                            "Page {}: dropping region {:?}, recognition failed: {}",
                            page.page_number, bbox, e
                        );
                        report.recognition_failures += 1;
                    }
                    Attempt::Cancelled => return Ok(Attempt::Cancelled),
                }
            }
        }

        info!(
            "Analyzed {} pages: {} regions, {} problems, {} recognition failures",
            report.pages,
            report.regions_detected,
            report.problems.len(),
            report.recognition_failures
        );
        Ok(Attempt::Finished(report))
    }

    /// Charge for and explain confirmed problems
    #[instrument(skip(self, request, cancel, events), fields(user_id = %request.user_id, problems = request.problems.len(), mode = %request.mode))]
    pub async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
        events: EventSink,
    ) -> BatchResult<BatchOutcome> {
        if request.problems.is_empty() {
            return Err(BatchError::EmptyBatch);
        }
        let resumed = request.batch_id.is_some();
        let mut run = match request.batch_id {
            Some(batch_id) => BatchRun::resume(batch_id, events),
            None => BatchRun::new(events),
        };
        let _guard = self.begin(&request.user_id, &run.batch_id, &cancel)?;

        if resumed {
            let pending = self
                .session(&request.user_id)
                .lock()
                .awaiting_selection
                .remove(&run.batch_id);
            if !pending {
                warn!(
                    "User {} tried to resume batch {}, which is not awaiting selection",
                    request.user_id, run.batch_id
                );
                return Err(BatchError::NotAwaitingSelection(run.batch_id.clone()));
            }
        }

        self.generate_in(
            &mut run,
            &request.user_id,
            request.tier,
            request.mode,
            request.problems,
            &cancel,
        )
        .await
    }

    async fn generate_in(
        &self,
        run: &mut BatchRun,
        user_id: &str,
        tier: UsageTier,
        mode: ExplanationMode,
        problems: Vec<AnalyzedProblem>,
        cancel: &CancellationToken,
    ) -> BatchResult<BatchOutcome> {
        let start = Instant::now();
        let requested = problems.len() as u32;

        if cancel.is_cancelled() {
            run.transition(BatchState::Cancelled)?;
            self.record_finished(BatchState::Cancelled, 0, 0);
            return Ok(BatchOutcome::empty(run, mode));
        }

        run.transition(BatchState::Charging)?;
        let receipt = match self.ledger.charge_mode(user_id, tier, mode, requested).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("Batch {} not charged: {}", run.batch_id, e);
                run.transition(BatchState::Failed)?;
                self.record_finished(BatchState::Failed, 0, 0);
                return Err(e);
            }
        };

        // Quota is held from here on. The settlement refunds unfinished items
        // even if this future is dropped before the end.
        let session = self.session(user_id);
        let mut settlement = Settlement {
            ledger: Arc::clone(&self.ledger),
            session: Arc::clone(&session),
            receipt,
            batch_id: run.batch_id.clone(),
            events: run.events.clone(),
            metrics: self.metrics.clone(),
            record_ids: Vec::with_capacity(problems.len()),
            reached: 0,
            completed: 0,
            settled: false,
        };

        let mut items = Vec::with_capacity(problems.len());
        for (idx, analyzed) in problems.into_iter().enumerate() {
            let request = ExplanationRequest {
                problem_text: analyzed.problem.prompt_text(),
                problem_type: analyzed.problem.problem_type,
                mode,
            };
            let record = ExplanationRecord {
                id: self.next_record_id.fetch_add(1, Ordering::Relaxed),
                persisted_id: None,
                batch_id: run.batch_id.clone(),
                markdown: String::new(),
                is_loading: true,
                is_error: false,
                error_message: None,
                page_number: analyzed.page_number,
                problem_number: idx as u32 + 1,
                image: analyzed.image,
                original_problem_text: analyzed.problem.problem_body,
                problem_type: analyzed.problem.problem_type,
                choices: analyzed.problem.choices,
                mode,
                difficulty: None,
                core_concepts: Vec::new(),
            };
            settlement.record_ids.push(record.id);
            items.push((record.id, request));
            session.lock().records.push(record.clone());
            run.events.emit(BatchEvent::RecordCreated(record));
        }

        run.settle(BatchState::Generating);

        let mut failed = 0u32;
        for (record_id, request) in &items {
            if cancel.is_cancelled() {
                break;
            }
            let generator = &self.generator;
            let attempt = self
                .generation_policy
                .run(cancel, || generator.generate(request))
                .await;

            let updated = match attempt {
                Attempt::Finished(Ok(explanation)) => {
                    settlement.completed += 1;
                    update_record(&session, *record_id, |r| apply_success(r, explanation))
                }
                Attempt::Finished(Err(e)) => {
                    failed += 1;
                    warn!("Batch {}: record {} failed: {}", run.batch_id, record_id, e);
                    update_record(&session, *record_id, |r| apply_failure(r, &e))
                }
                // In-flight call abandoned; settlement drops its placeholder
                Attempt::Cancelled => break,
            };
            settlement.reached += 1;
            if let Some(record) = updated {
                run.events.emit(BatchEvent::RecordUpdated(record));
            }
        }

        // A cancel that lands after the last item does not make the batch cancelled
        let stopped_early = settlement.reached < items.len();
        let completed = settlement.completed;
        let (refunded, quota_warning) = settlement.settle().await;

        let final_state = if stopped_early {
            BatchState::Cancelled
        } else {
            BatchState::Completed
        };
        run.settle(final_state);
        self.record_finished(final_state, completed, failed);

        info!(
            "Batch {} {} in {:.2}s: {} ok, {} failed, {} refunded",
            run.batch_id,
            final_state,
            start.elapsed().as_secs_f64(),
            completed,
            failed,
            refunded
        );

        let records = {
            let s = session.lock();
            s.records
                .iter()
                .filter(|r| items.iter().any(|(id, _)| *id == r.id))
                .cloned()
                .collect::<Vec<_>>()
        };

        Ok(BatchOutcome {
            batch_id: run.batch_id.clone(),
            state: run.state,
            mode,
            requested,
            completed,
            failed,
            refunded,
            records,
            quota_warning,
            analysis: None,
        })
    }

    /// Regenerate one finished record without touching quota
    #[instrument(skip(self, cancel))]
    pub async fn retry_record(
        &self,
        user_id: &str,
        record_id: u64,
        cancel: &CancellationToken,
    ) -> BatchResult<ExplanationRecord> {
        let session = self.session(user_id);
        let (request, previous) = {
            let mut s = session.lock();
            let record = s
                .records
                .iter_mut()
                .find(|r| r.id == record_id)
                .ok_or(BatchError::RecordNotFound(record_id))?;
            if record.is_loading {
                return Err(BatchError::RecordBusy(record_id));
            }
            let previous = record.clone();
            record.is_loading = true;
            let request = ExplanationRequest {
                problem_text: record.prompt_text(),
                problem_type: record.problem_type,
                mode: record.mode,
            };
            (request, previous)
        };

        let restore = RetryRestore {
            session: Arc::clone(&session),
            previous: Some(previous),
        };
        let generator = &self.generator;
        let attempt = self
            .generation_policy
            .run(cancel, || generator.generate(&request))
            .await;

        let updated = match attempt {
            Attempt::Finished(Ok(explanation)) => {
                restore.disarm();
                info!("Record {} regenerated", record_id);
                update_record(&session, record_id, |r| apply_success(r, explanation))
            }
            Attempt::Finished(Err(e)) => {
                restore.disarm();
                warn!("Retry of record {} failed: {}", record_id, e);
                update_record(&session, record_id, |r| apply_failure(r, &e))
            }
            Attempt::Cancelled => {
                drop(restore);
                update_record(&session, record_id, |_| {})
            }
        };
        updated.ok_or(BatchError::RecordNotFound(record_id))
    }

    /// Records of every batch this user ran in this process
    pub fn records(&self, user_id: &str) -> Vec<ExplanationRecord> {
        self.sessions
            .get(user_id)
            .map(|s| {
                let session = s.lock();
                session.records.clone()
            })
            .unwrap_or_default()
    }

    pub fn delete_record(&self, user_id: &str, record_id: u64) -> BatchResult<ExplanationRecord> {
        let session = self.session(user_id);
        let mut s = session.lock();
        let pos = s
            .records
            .iter()
            .position(|r| r.id == record_id)
            .ok_or(BatchError::RecordNotFound(record_id))?;
        if s.records[pos].is_loading {
            return Err(BatchError::RecordBusy(record_id));
        }
        Ok(s.records.remove(pos))
    }

    /// Fire the cancellation token of the user's active batch
    pub fn cancel_active(&self, user_id: &str) -> bool {
        let Some(session) = self.sessions.get(user_id).map(|s| Arc::clone(&s)) else {
            return false;
        };
        let s = session.lock();
        match s.active {
            Some(ref active) => {
                info!("Cancelling batch {} for {}", active.batch_id, user_id);
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn has_active_batch(&self, user_id: &str) -> bool {
        self.sessions
            .get(user_id)
            .is_some_and(|s| {
                let session = s.lock();
                session.active.is_some()
            })
    }

    pub async fn usage(&self, user_id: &str, tier: UsageTier) -> BatchResult<UsageSnapshot> {
        Ok(self.ledger.usage(user_id, tier).await?)
    }

    pub async fn charge_export(&self, user_id: &str, tier: UsageTier, count: u32) -> BatchResult<ChargeReceipt> {
        self.ledger.charge_export(user_id, tier, count).await
    }
}

fn update_record(
    session: &Mutex<UserSession>,
    record_id: u64,
    f: impl FnOnce(&mut ExplanationRecord),
) -> Option<ExplanationRecord> {
    let mut s = session.lock();
    let record = s.records.iter_mut().find(|r| r.id == record_id)?;
    f(record);
    Some(record.clone())
}

fn apply_success(record: &mut ExplanationRecord, explanation: Explanation) {
    record.markdown = explanation.markdown;
    record.core_concepts = explanation.core_concepts;
    record.difficulty = explanation.difficulty;
    record.is_loading = false;
    record.is_error = false;
    record.error_message = None;
}

fn apply_failure(record: &mut ExplanationRecord, error: &ApiError) {
    record.is_loading = false;
    record.is_error = true;
    record.error_message = Some(format!(
        "Explanation could not be generated ({}). Retry this problem.",
        error
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ProblemType;

    fn record() -> ExplanationRecord {
        ExplanationRecord {
            id: 7,
            persisted_id: None,
            batch_id: "b".to_string(),
            markdown: String::new(),
            is_loading: true,
            is_error: false,
            error_message: None,
            page_number: 1,
            problem_number: 1,
            image: None,
            original_problem_text: "x + 1 = 2".to_string(),
            problem_type: ProblemType::FreeResponse,
            choices: None,
            mode: ExplanationMode::Fast,
            difficulty: None,
            core_concepts: Vec::new(),
        }
    }

    #[test]
    fn test_failure_then_success_clears_error() {
        let mut r = record();
        apply_failure(&mut r, &ApiError::other("boom"));
        assert!(r.is_error && !r.is_loading);
        assert!(r.error_message.as_deref().unwrap().contains("Retry"));

        apply_success(
            &mut r,
            Explanation {
                markdown: "x = 1".to_string(),
                core_concepts: vec!["일차방정식".to_string()],
                difficulty: Some(1),
            },
        );
        assert!(r.is_success());
        assert!(r.error_message.is_none());
        assert_eq!(r.markdown, "x = 1");
    }

    #[test]
    fn test_run_rejects_invalid_transition() {
        let mut run = BatchRun::new(EventSink::disabled());
        assert!(run.transition(BatchState::Generating).is_err());
        assert_eq!(run.state, BatchState::Idle);
        run.transition(BatchState::Charging).unwrap();
        run.transition(BatchState::Generating).unwrap();
        assert_eq!(run.state, BatchState::Generating);
    }

    #[test]
    fn test_resumed_run_starts_awaiting_selection() {
        let mut run = BatchRun::resume("batch-1".to_string(), EventSink::disabled());
        assert_eq!(run.state, BatchState::AwaitingUserSelection);
        assert!(run.transition(BatchState::Charging).is_ok());
    }
}
