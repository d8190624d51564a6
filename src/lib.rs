// Library exports for math problem region detection and explanation batches

// Core modules
pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{ApiError, ApiErrorKind, BatchError, ConfigError, DetectionError, QuotaError},
    types::{
        AnalyzedProblem, Bbox, DetectedProblem, Explanation, ExplanationMode, ExplanationRecord,
        ExplanationRequest, PageInput, ProblemType, Rect, UsageCounter, UsageTier,
    },
};

pub use middleware::{ApiKeyPool, Attempt, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};

pub use orchestration::{BatchEvent, BatchOrchestrator, BatchOutcome, BatchRequest, BatchState, EventSink};

pub use services::{
    ExplanationGenerator, GeminiExplainer, GeminiRecognizer, InMemoryQuotaStore, LlmClient,
    QuotaLedger, QuotaStore, RegionDetector, RegionRecognizer,
};

pub use utils::{load_image_from_memory_async, Metrics};
