use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

use super::client::{parse_model_output, LlmClient};
use super::ExplanationGenerator;
use crate::core::config::ApiConfig;
use crate::core::errors::{ApiError, ApiResult};
use crate::core::types::{Explanation, ExplanationMode, ExplanationRequest, ProblemType};

#[derive(Debug, Deserialize)]
struct ExplanationResponse {
    markdown: String,
    #[serde(default)]
    core_concepts: Vec<String>,
    #[serde(default)]
    difficulty: Option<u8>,
}

/// Text-model explainer; each mode maps to its own model
pub struct GeminiExplainer {
    client: Arc<LlmClient>,
    api: ApiConfig,
}

impl GeminiExplainer {
    pub fn new(client: Arc<LlmClient>, api: &ApiConfig) -> Self {
        Self {
            client,
            api: api.clone(),
        }
    }

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "markdown": {"type": "string"},
                "core_concepts": {"type": "array", "items": {"type": "string"}},
                "difficulty": {"type": "integer"}
            },
            "required": ["markdown", "core_concepts"]
        })
    }
}

fn build_prompt(request: &ExplanationRequest) -> String {
    let depth = match request.mode {
        ExplanationMode::Fast => "Keep it short: the key idea and the essential steps only.",
        ExplanationMode::Standard => "Explain every step a student needs to follow the solution.",
        ExplanationMode::Quality => {
            "Explain every step in detail, justify each transformation, \
             and point out common mistakes and an alternative approach when one exists."
        }
    };
    let kind = match request.problem_type {
        ProblemType::MultipleChoice => {
            "This is a multiple-choice problem; finish by naming the correct option."
        }
        ProblemType::FreeResponse => "This is a free-response problem; finish with the final answer.",
    };

    format!(
        "You are a math tutor. Write a step-by-step explanation in Korean for the problem below. \
         Use Markdown with LaTeX between $ signs. {} {}\n\
         Return JSON with: \
         - 'markdown': the explanation \
         - 'core_concepts': up to 5 short names of the concepts used \
         - 'difficulty': an integer from 1 (easy) to 5 (hard)\n\n\
         Problem:\n{}",
        depth, kind, request.problem_text
    )
}

fn to_explanation(response: ExplanationResponse) -> ApiResult<Explanation> {
    let markdown = response.markdown.trim().to_string();
    if markdown.is_empty() {
        return Err(ApiError::other("Model returned an empty explanation"));
    }
    let core_concepts = response
        .core_concepts
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    Ok(Explanation {
        markdown,
        core_concepts,
        difficulty: response.difficulty.map(|d| d.clamp(1, 5)),
    })
}

#[async_trait]
impl ExplanationGenerator for GeminiExplainer {
    #[instrument(skip(self, request), fields(mode = %request.mode))]
    async fn generate(&self, request: &ExplanationRequest) -> ApiResult<Explanation> {
        let parts = vec![serde_json::json!({"text": build_prompt(request)})];
        let value = self
            .client
            .generate_json(self.api.model_for(request.mode), parts, Self::schema())
            .await?;
        to_explanation(parse_model_output(value)?)
    }
}
