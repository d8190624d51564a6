use anyhow::{Context, Result};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::core::config::ApiConfig;
use crate::core::errors::{ApiError, ApiErrorKind, ApiResult};
use crate::middleware::api_key_pool::ApiKeyPool;
use crate::middleware::circuit_breaker::CircuitBreaker;
use crate::utils::Metrics;

/// Gemini-compatible `generateContent` client with key pool, circuit breaker and metrics.
///
/// One call is one HTTP attempt. Retrying is left to the caller's
/// `RetryPolicy`, which needs the typed `ApiErrorKind` this client returns.
pub struct LlmClient {
    base_url: String,
    api_key_pool: Arc<ApiKeyPool>,
    http_client: reqwest::Client,
    circuit_breaker: CircuitBreaker,
    metrics: Option<Metrics>,
    enable_thinking: bool,
}

impl LlmClient {
    pub fn new(
        api: &ApiConfig,
        circuit_breaker: Option<CircuitBreaker>,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        let api_key_pool = Arc::new(ApiKeyPool::new(api.api_keys.clone()));

        // Create HTTP client with timeout and connection pooling
        let http_client = reqwest::Client::builder()
            .timeout(api.request_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key_pool,
            http_client,
            circuit_breaker: circuit_breaker.unwrap_or_default(),
            metrics,
            enable_thinking: api.enable_thinking,
        })
    }

    pub async fn total_keys(&self) -> usize {
        self.api_key_pool.total_keys().await
    }

    pub fn key_pool(&self) -> &ApiKeyPool {
        &self.api_key_pool
    }

    /// Send `parts` to `model` and return the JSON document the model produced
    /// under `schema`.
    #[instrument(skip(self, parts, schema), fields(model = model, parts = parts.len()))]
    pub async fn generate_json(&self, model: &str, parts: Vec<Value>, schema: Value) -> ApiResult<Value> {
        self.circuit_breaker.check()?;

        if self.api_key_pool.total_keys().await == 0 {
            return Err(ApiError::other("No LLM API keys configured"));
        }
        let (key_idx, api_key) = match self.api_key_pool.acquire().await {
            Some(key) => key,
            None => {
                let wait = self.api_key_pool.next_available_in().await;
                return Err(ApiError::rate_limited(wait, "All API keys are cooling down"));
            }
        };

        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let mut request_body = serde_json::json!({
            "contents": [{
                "parts": parts
            }],
            "generationConfig": {
                "response_mime_type": "application/json",
                "response_schema": schema
            }
        });
        if !self.enable_thinking {
            request_body["generationConfig"]["thinkingConfig"] = serde_json::json!({
                "thinking_budget": 0
            });
        }

        let start = Instant::now();
        let result = self.send(&url, &api_key, &request_body).await;
        let duration = start.elapsed();

        match result {
            Ok(response) => {
                self.circuit_breaker.record_success();
                self.api_key_pool.record_success(key_idx).await;

                let (input_tokens, output_tokens) = extract_token_usage(&response);
                if let Some(ref m) = self.metrics {
                    m.record_api_call(true, duration, input_tokens, output_tokens);
                }
                debug!(
                    "{} answered in {:?} ({} in / {} out tokens)",
                    model, duration, input_tokens, output_tokens
                );

                extract_model_json(&response)
            }
            Err(e) => {
                self.circuit_breaker.record_failure(e.kind);
                match e.kind {
                    ApiErrorKind::RateLimited { retry_after } => {
                        self.api_key_pool.record_rate_limited(key_idx, retry_after).await;
                    }
                    ApiErrorKind::QuotaExceeded | ApiErrorKind::Other => {
                        self.api_key_pool.record_failure(key_idx).await;
                    }
                    ApiErrorKind::Unavailable | ApiErrorKind::Timeout => {}
                }
                if let Some(ref m) = self.metrics {
                    m.record_api_call(false, duration, 0, 0);
                }
                warn!("{} call with key {} failed ({:?}): {}", model, key_idx, e.kind, e);
                Err(e)
            }
        }
    }

    async fn send(&self, url: &str, api_key: &str, body: &Value) -> ApiResult<Value> {
        let response = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", api_key)
            .json(body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(status, retry_after.as_deref(), &error_text));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ApiError::other(format!("Failed to parse API response: {}", e)))
    }
}

fn classify_transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::new(ApiErrorKind::Timeout, format!("HTTP request timed out: {}", e))
    } else if e.is_connect() {
        ApiError::unavailable(format!("Could not reach LLM API: {}", e))
    } else {
        ApiError::other(format!("HTTP request failed: {}", e))
    }
}

/// Map a non-success response onto an `ApiErrorKind` using status and body structure only
pub fn classify_http_failure(status: StatusCode, retry_after: Option<&str>, body: &str) -> ApiError {
    let message = format!("API request failed: {} - {}", status, truncate(body, 300));
    match status.as_u16() {
        429 => {
            let wait = retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            ApiError::rate_limited(wait, message)
        }
        500 | 502 | 503 | 504 => ApiError::unavailable(message),
        _ => {
            let error_status = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v["error"]["status"].as_str().map(str::to_string));
            if error_status.as_deref() == Some("RESOURCE_EXHAUSTED") {
                ApiError::new(ApiErrorKind::QuotaExceeded, message)
            } else {
                ApiError::other(message)
            }
        }
    }
}

/// Pull the model's JSON text out of a `generateContent` response and parse it
fn extract_model_json(response: &Value) -> ApiResult<Value> {
    let text = response["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .ok_or_else(|| {
            let reason = response["candidates"][0]["finishReason"]
                .as_str()
                .unwrap_or("no candidates");
            ApiError::other(format!("Missing text in API response ({})", reason))
        })?;
    serde_json::from_str(text).map_err(|e| ApiError::other(format!("Model returned invalid JSON: {}", e)))
}

/// Deserialize a model JSON document into a typed response
pub fn parse_model_output<T: DeserializeOwned>(value: Value) -> ApiResult<T> {
    serde_json::from_value(value)
        .map_err(|e| ApiError::other(format!("Model response did not match schema: {}", e)))
}

fn extract_token_usage(response: &Value) -> (u64, u64) {
    let usage_metadata = &response["usageMetadata"];
    let input_tokens = usage_metadata["promptTokenCount"].as_u64().unwrap_or(0);
    let output_tokens = usage_metadata["candidatesTokenCount"].as_u64().unwrap_or(0);

    (input_tokens, output_tokens)
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_with_retry_after() {
        let err = classify_http_failure(StatusCode::TOO_MANY_REQUESTS, Some("7"), "");
        assert_eq!(
            err.kind,
            ApiErrorKind::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );

        let err = classify_http_failure(StatusCode::TOO_MANY_REQUESTS, Some("soon"), "");
        assert_eq!(err.kind, ApiErrorKind::RateLimited { retry_after: None });
    }

    #[test]
    fn test_classify_outages() {
        for code in [500u16, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_http_failure(status, None, "boom").kind, ApiErrorKind::Unavailable);
        }
    }

    #[test]
    fn test_classify_resource_exhausted_body() {
        let body = r#"{"error":{"code":403,"status":"RESOURCE_EXHAUSTED","message":"quota"}}"#;
        let err = classify_http_failure(StatusCode::FORBIDDEN, None, body);
        assert_eq!(err.kind, ApiErrorKind::QuotaExceeded);
        assert!(!err.kind.is_retryable());
    }

    #[test]
    fn test_message_text_does_not_drive_classification() {
        // Prose mentioning 503 or quota must not change the kind
        let err = classify_http_failure(StatusCode::BAD_REQUEST, None, "quota 503 overloaded");
        assert_eq!(err.kind, ApiErrorKind::Other);
    }

    #[test]
    fn test_extract_model_json() {
        let response = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "{\"markdown\":\"# hi\"}"}]}}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 34}
        });
        let value = extract_model_json(&response).unwrap();
        assert_eq!(value["markdown"], "# hi");
        assert_eq!(extract_token_usage(&response), (12, 34));

        let blocked = serde_json::json!({"candidates": [{"finishReason": "SAFETY"}]});
        let err = extract_model_json(&blocked).unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Other);
        assert!(err.message.contains("SAFETY"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("해적해적", 2), "해적");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
