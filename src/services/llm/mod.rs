// LLM-backed collaborators: region recognition and explanation generation

pub mod client;
pub mod explainer;
pub mod recognizer;

use async_trait::async_trait;
use image::DynamicImage;

use crate::core::errors::ApiResult;
use crate::core::types::{Bbox, DetectedProblem, Explanation, ExplanationRequest};

pub use client::LlmClient;
pub use explainer::GeminiExplainer;
pub use recognizer::GeminiRecognizer;

/// Reads the problem inside one detected region of a page
#[async_trait]
pub trait RegionRecognizer: Send + Sync {
    async fn recognize(&self, page: &DynamicImage, bbox: Bbox) -> ApiResult<DetectedProblem>;
}

/// Produces a step-by-step explanation for one problem
#[async_trait]
pub trait ExplanationGenerator: Send + Sync {
    async fn generate(&self, request: &ExplanationRequest) -> ApiResult<Explanation>;
}
