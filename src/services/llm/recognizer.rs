use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use image::DynamicImage;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::client::{parse_model_output, LlmClient};
use super::RegionRecognizer;
use crate::core::errors::{ApiError, ApiResult};
use crate::core::types::{Bbox, DetectedProblem, ProblemType};
use crate::utils::crop_bbox_png;

const RECOGNITION_PROMPT: &str = "The image shows exactly one math problem cropped from a worksheet. \
     Transcribe it. Return JSON with: \
     - 'problem_type': 'multiple-choice' when answer options are printed, otherwise 'free-response' \
     - 'problem_body': the problem statement, formulas in LaTeX between $ signs, without the answer options \
     - 'choices': the answer options exactly as printed, one per line (empty string when there are none)";

#[derive(Debug, Deserialize)]
struct RecognitionResponse {
    problem_type: ProblemType,
    problem_body: String,
    #[serde(default)]
    choices: Option<String>,
}

/// Vision-model recognizer: crops the region and asks the model to transcribe it
pub struct GeminiRecognizer {
    client: Arc<LlmClient>,
    model: String,
}

impl GeminiRecognizer {
    pub fn new(client: Arc<LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "problem_type": {"type": "string", "enum": ["multiple-choice", "free-response"]},
                "problem_body": {"type": "string"},
                "choices": {"type": "string"}
            },
            "required": ["problem_type", "problem_body"]
        })
    }
}

#[async_trait]
impl RegionRecognizer for GeminiRecognizer {
    #[instrument(skip(self, page), fields(model = %self.model))]
    async fn recognize(&self, page: &DynamicImage, bbox: Bbox) -> ApiResult<DetectedProblem> {
        let png = crop_bbox_png(page, &bbox)
            .map_err(|e| ApiError::other(format!("Failed to crop region: {}", e)))?;
        debug!("Recognizing region ({} bytes PNG)", png.len());

        let parts = vec![
            serde_json::json!({
                "inline_data": {
                    "mime_type": "image/png",
                    "data": general_purpose::STANDARD.encode(&png)
                }
            }),
            serde_json::json!({"text": RECOGNITION_PROMPT}),
        ];

        let value = self.client.generate_json(&self.model, parts, Self::schema()).await?;
        to_detected_problem(parse_model_output(value)?, bbox)
    }
}

fn to_detected_problem(response: RecognitionResponse, bbox: Bbox) -> ApiResult<DetectedProblem> {
    let problem_body = response.problem_body.trim().to_string();
    if problem_body.is_empty() {
        return Err(ApiError::other("No problem text recognized in region"));
    }
    let choices = response
        .choices
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    Ok(DetectedProblem {
        bbox,
        problem_type: response.problem_type,
        problem_body,
        choices,
    })
}
