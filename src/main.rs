// HTTP entry point for problem detection and explanation batches

use haejeok::{
    core::{
        errors::{BatchError, DetectionError, QuotaError},
        types::{PageInput, UsageTier},
        Config,
    },
    orchestration::{BatchEvent, BatchOrchestrator, BatchRequest, EventSink, GenerateRequest},
    services::{
        detection::RegionDetector,
        llm::{GeminiExplainer, GeminiRecognizer, LlmClient},
        quota::{InMemoryQuotaStore, QuotaLedger},
    },
    utils::Metrics,
    CircuitBreaker, CircuitBreakerConfig, ExplanationMode,
};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<BatchOrchestrator>,
    llm_client: Arc<LlmClient>,
    metrics: Metrics,
}

type ApiResponse<T> = Result<Json<T>, (StatusCode, Json<serde_json::Value>)>;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new()?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "haejeok={},tower_http=info",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== HAEJEOK PROBLEM EXPLAINER ===");
    info!(
        "Config: block={} gap={:.1}% attempts={} timeout={}s keys={}",
        config.detection.block_size,
        config.detection.gap_ratio * 100.0,
        config.batch.max_attempts,
        config.batch.generation_timeout.as_secs(),
        config.api_keys().len()
    );
    if config.api_keys().is_empty() {
        warn!("GEMINI_API_KEYS is empty; recognition and generation calls will fail");
    }

    // Initialize metrics
    let metrics = Metrics::new();

    let breaker = CircuitBreaker::new(CircuitBreakerConfig::default(), Some(metrics.clone()));
    let llm_client = Arc::new(LlmClient::new(&config.api, Some(breaker), Some(metrics.clone()))?);
    let detector = Arc::new(RegionDetector::new(config.detection.clone(), Some(metrics.clone())));
    let recognizer = Arc::new(GeminiRecognizer::new(
        Arc::clone(&llm_client),
        config.api.recognition_model.clone(),
    ));
    let explainer = Arc::new(GeminiExplainer::new(Arc::clone(&llm_client), &config.api));
    let ledger = Arc::new(QuotaLedger::new(
        Arc::new(InMemoryQuotaStore::new()),
        config.quota.clone(),
        Some(metrics.clone()),
    ));

    info!("Initializing batch orchestrator...");
    let orchestrator = Arc::new(BatchOrchestrator::new(
        detector,
        recognizer,
        explainer,
        ledger,
        &config.batch,
        Some(metrics.clone()),
    ));
    let state = AppState {
        orchestrator,
        llm_client,
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/health/api-keys", get(health_api_keys))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/detect", post(detect_endpoint))
        .route("/batches", post(start_batch))
        .route("/batches/generate", post(generate_batch))
        .route("/users/:user_id/cancel", post(cancel_batch))
        .route("/users/:user_id/records", get(list_records))
        .route("/users/:user_id/records/:id/retry", post(retry_record))
        .route("/users/:user_id/records/:id", axum::routing::delete(delete_record))
        .route("/users/:user_id/usage", get(usage))
        .route("/users/:user_id/exports", post(charge_export))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.server.max_upload_mb * 1024 * 1024))
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET    /                                 - Root endpoint");
    info!("  GET    /health                           - Health check");
    info!("  GET    /health/api-keys                  - API key health status");
    info!("  GET    /metrics                          - Prometheus metrics");
    info!("  GET    /stats                            - Detailed statistics");
    info!("  POST   /detect                           - Detect problem regions on one page");
    info!("  POST   /batches                          - Analyze pages and explain problems");
    info!("  POST   /batches/generate                 - Explain confirmed problems");
    info!("  POST   /users/:user_id/cancel            - Cancel the running batch");
    info!("  GET    /users/:user_id/records           - Explanation records");
    info!("  POST   /users/:user_id/records/:id/retry - Regenerate one record");
    info!("  DELETE /users/:user_id/records/:id       - Delete one record");
    info!("  GET    /users/:user_id/usage             - Quota usage");
    info!("  POST   /users/:user_id/exports           - Charge document exports");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn batch_error_response(e: BatchError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        BatchError::PageFailed { source, .. } => match source {
            DetectionError::Decode(_) | DetectionError::InvalidImageSize { .. } => StatusCode::BAD_REQUEST,
            DetectionError::TaskJoinFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
        BatchError::QuotaExceeded { remaining, .. } | BatchError::ExportQuotaExceeded { remaining, .. } => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({ "error": e.to_string(), "remaining": remaining })),
            );
        }
        BatchError::Quota(QuotaError::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        BatchError::Quota(_) | BatchError::InvalidTransition { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        BatchError::BatchInProgress(_)
        | BatchError::RecordBusy(_)
        | BatchError::NotAwaitingSelection(_) => StatusCode::CONFLICT,
        BatchError::EmptyBatch => StatusCode::BAD_REQUEST,
        BatchError::RecordNotFound(_) => StatusCode::NOT_FOUND,
    };
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    error_body(status, e.to_string())
}

/// Event sink that logs progress; the HTTP API answers once the batch ends
fn logging_event_sink() -> EventSink {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                BatchEvent::StateChanged { batch_id, from, to } => {
                    info!("Batch {}: {} -> {}", batch_id, from, to)
                }
                BatchEvent::RegionsDetected {
                    batch_id,
                    page_number,
                    regions,
                } => debug!("Batch {}: page {} has {} regions", batch_id, page_number, regions.len()),
                BatchEvent::RecordCreated(r) | BatchEvent::RecordUpdated(r) => debug!(
                    "Batch {}: record {} loading={} error={}",
                    r.batch_id, r.id, r.is_loading, r.is_error
                ),
                BatchEvent::RecordDropped { batch_id, record_id } => {
                    debug!("Batch {}: record {} dropped", batch_id, record_id)
                }
                BatchEvent::QuotaReconciliationFailed {
                    batch_id,
                    user_id,
                    counter,
                    period,
                    count,
                    message,
                } => error!(
                    "Batch {}: {} {} for {} in {} not refunded: {}",
                    batch_id, count, counter, user_id, period, message
                ),
            }
        }
    });
    EventSink::new(tx)
}

async fn root() -> &'static str {
    "Haejeok - math problem region detection and explanation service"
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API key health status endpoint
async fn health_api_keys(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.llm_client.key_pool().stats().await;
    let keys: Vec<_> = stats
        .iter()
        .map(|k| {
            serde_json::json!({
                "index": k.index,
                "health": format!("{:?}", k.health),
                "total_requests": k.total_requests,
                "total_failures": k.total_failures,
            })
        })
        .collect();
    Json(serde_json::json!({
        "total_keys": stats.len(),
        "keys": keys,
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

/// Detect problem regions on a single page
///
/// # Request Format:
/// - multipart/form-data, field "image": one PNG/JPEG page
async fn detect_endpoint(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResponse<serde_json::Value> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| error_body(StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("image") {
            continue;
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| error_body(StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;

        let (image, regions) = state
            .orchestrator
            .detector()
            .detect_bytes(&data)
            .await
            .map_err(|e| match e {
                DetectionError::TaskJoinFailed(_) => {
                    error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                }
                _ => error_body(StatusCode::BAD_REQUEST, e.to_string()),
            })?;

        return Ok(Json(serde_json::json!({
            "width": image.width(),
            "height": image.height(),
            "regions": regions,
        })));
    }

    Err(error_body(StatusCode::BAD_REQUEST, "Missing 'image' field"))
}

#[derive(Debug, Deserialize)]
struct BatchOptions {
    user_id: String,
    #[serde(default)]
    tier: UsageTier,
    mode: ExplanationMode,
    #[serde(default)]
    manual_selection: bool,
}

/// Analyze pages and explain every recognized problem
///
/// # Request Format:
/// - multipart/form-data
/// - Field "pages": one or more page images, in page order
/// - Field "options": JSON `{user_id, tier, mode, manual_selection}`
async fn start_batch(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResponse<haejeok::orchestration::BatchOutcome> {
    let mut pages = Vec::new();
    let mut options: Option<BatchOptions> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| error_body(StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "pages" => {
                let filename = field.file_name().unwrap_or("page.png").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| error_body(StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;
                pages.push(PageInput {
                    page_number: pages.len() as u32 + 1,
                    filename,
                    image_bytes: Arc::new(data.to_vec()),
                });
            }
            "options" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| error_body(StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;
                options = Some(serde_json::from_str(&text).map_err(|e| {
                    error_body(StatusCode::BAD_REQUEST, format!("Invalid options: {}", e))
                })?);
            }
            _ => {}
        }
    }

    let options = options.ok_or_else(|| error_body(StatusCode::BAD_REQUEST, "Missing 'options' field"))?;
    if pages.is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "No pages provided"));
    }
    info!(
        "Batch request from {}: {} pages, mode {}",
        options.user_id,
        pages.len(),
        options.mode
    );

    let request = BatchRequest {
        user_id: options.user_id,
        tier: options.tier,
        mode: options.mode,
        pages,
        manual_selection: options.manual_selection,
    };
    state
        .orchestrator
        .start_batch(request, CancellationToken::new(), logging_event_sink())
        .await
        .map(Json)
        .map_err(batch_error_response)
}

/// Explain problems confirmed by the user
async fn generate_batch(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> ApiResponse<haejeok::orchestration::BatchOutcome> {
    state
        .orchestrator
        .generate(request, CancellationToken::new(), logging_event_sink())
        .await
        .map(Json)
        .map_err(batch_error_response)
}

async fn cancel_batch(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    let cancelled = state.orchestrator.cancel_active(&user_id);
    Json(serde_json::json!({ "cancelled": cancelled }))
}

async fn list_records(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<Vec<haejeok::core::ExplanationRecord>> {
    Json(state.orchestrator.records(&user_id))
}

async fn retry_record(
    State(state): State<AppState>,
    Path((user_id, id)): Path<(String, u64)>,
) -> ApiResponse<haejeok::core::ExplanationRecord> {
    state
        .orchestrator
        .retry_record(&user_id, id, &CancellationToken::new())
        .await
        .map(Json)
        .map_err(batch_error_response)
}

async fn delete_record(
    State(state): State<AppState>,
    Path((user_id, id)): Path<(String, u64)>,
) -> ApiResponse<haejeok::core::ExplanationRecord> {
    state
        .orchestrator
        .delete_record(&user_id, id)
        .map(Json)
        .map_err(batch_error_response)
}

#[derive(Debug, Deserialize)]
struct TierQuery {
    #[serde(default)]
    tier: UsageTier,
}

async fn usage(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<TierQuery>,
) -> ApiResponse<haejeok::core::types::UsageSnapshot> {
    state
        .orchestrator
        .usage(&user_id, query.tier)
        .await
        .map(Json)
        .map_err(batch_error_response)
}

#[derive(Debug, Deserialize)]
struct ExportRequest {
    #[serde(default)]
    tier: UsageTier,
    #[serde(default = "default_export_count")]
    count: u32,
}

fn default_export_count() -> u32 {
    1
}

async fn charge_export(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<ExportRequest>,
) -> ApiResponse<haejeok::core::types::ChargeReceipt> {
    state
        .orchestrator
        .charge_export(&user_id, request.tier, request.count)
        .await
        .map(Json)
        .map_err(batch_error_response)
}
