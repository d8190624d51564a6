// Error types for detection, external API calls, quota accounting and batches
//
// Using thiserror for ergonomic error definitions with:
// - Type-safe error matching (retry policy is decided on ApiErrorKind)
// - Source error chaining

use std::time::Duration;
use thiserror::Error;

use crate::core::types::{ExplanationMode, UsageCounter};

/// Region detection errors
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Image decoding failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Invalid image dimensions: {width}x{height}")]
    InvalidImageSize { width: u32, height: u32 },

    #[error("Detection task failed: {0}")]
    TaskJoinFailed(String),
}

/// Classification of a failed external API call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Upstream asked us to slow down (HTTP 429)
    RateLimited { retry_after: Option<Duration> },
    /// Upstream is down or overloaded (HTTP 5xx, open circuit, no usable key)
    Unavailable,
    /// Upstream account quota is exhausted
    QuotaExceeded,
    /// The call did not finish within the per-attempt timeout
    Timeout,
    /// Anything else: malformed response, bad request, auth failure
    Other,
}

impl ApiErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable | Self::Timeout
        )
    }
}

/// Error returned by the recognition and generation collaborators
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::RateLimited { retry_after }, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Unavailable, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ApiErrorKind::Timeout,
            format!("No response within {}s", after.as_secs_f64()),
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Other, message)
    }
}

/// Quota store errors
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("Quota store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Refund of {count} {counter} exceeds charged usage {used} for period {period}")]
    RefundUnderflow {
        counter: UsageCounter,
        period: String,
        count: u32,
        used: u32,
    },
}

/// Batch orchestration errors
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Page {page_number} could not be analyzed: {source}")]
    PageFailed {
        page_number: u32,
        #[source]
        source: DetectionError,
    },

    #[error("Not enough {mode} quota: requested {requested}, remaining {remaining}")]
    QuotaExceeded {
        mode: ExplanationMode,
        requested: u32,
        remaining: u32,
    },

    #[error("Export quota exceeded: requested {requested}, remaining {remaining}")]
    ExportQuotaExceeded { requested: u32, remaining: u32 },

    #[error("Quota accounting failed: {0}")]
    Quota(#[from] QuotaError),

    #[error("A batch is already running for user {0}")]
    BatchInProgress(String),

    #[error("No problems to generate")]
    EmptyBatch,

    #[error("Batch {0} is not awaiting problem selection")]
    NotAwaitingSelection(String),

    #[error("Record {0} not found")]
    RecordNotFound(u64),

    #[error("Record {0} is still loading")]
    RecordBusy(u64),

    #[error("Invalid batch transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid detection config: {0}")]
    InvalidDetectionConfig(String),

    #[error("Invalid API config: {0}")]
    InvalidApiConfig(String),

    #[error("Invalid quota config: {0}")]
    InvalidQuotaConfig(String),

    #[error("Batch setting must be > 0, got {0}")]
    InvalidBatchSize(usize),
}

pub type DetectionResult<T> = Result<T, DetectionError>;
pub type ApiResult<T> = Result<T, ApiError>;
pub type QuotaResult<T> = Result<T, QuotaError>;
pub type BatchResult<T> = Result<T, BatchError>;
