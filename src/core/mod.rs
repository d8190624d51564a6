pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{ApiError, ApiErrorKind, BatchError, ConfigError, DetectionError, QuotaError};
pub use types::{
    AnalyzedProblem, Bbox, DetectedProblem, Explanation, ExplanationMode, ExplanationRecord,
    PageInput, ProblemType, Rect, UsageCounter, UsageTier,
};
