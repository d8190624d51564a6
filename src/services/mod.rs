pub mod detection;
pub mod llm;
pub mod quota;

// Re-export commonly used services
pub use detection::RegionDetector;
pub use llm::{ExplanationGenerator, GeminiExplainer, GeminiRecognizer, LlmClient, RegionRecognizer};
pub use quota::{InMemoryQuotaStore, QuotaLedger, QuotaStore};
