use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{InferenceClient, InferenceError, InferenceRequest};

const PROVIDER_ID: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

/// Hosted completion backend speaking the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    provider_id: String,
    api_key: String,
    api_base: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            provider_id: PROVIDER_ID.to_string(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    /// Name recorded in provenance in place of `anthropic`.
    pub fn with_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    pub(crate) fn to_api_request(&self, request: &InferenceRequest) -> ApiRequest {
        ApiRequest {
            model: self.model.clone(),
            system: request.system.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: request
                .messages
                .iter()
                .map(|m| ApiMessage {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl InferenceClient for AnthropicProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn submit(
        &self,
        request: &InferenceRequest,
        timeout: Duration,
    ) -> Result<String, InferenceError> {
        let url = format!("{}/v1/messages", self.api_base);
        let payload = self.to_api_request(request);

        let resp = self
            .client
            .post(url)
            .timeout(timeout)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| InferenceError::from_transport(&self.provider_id, e, timeout))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let headers = resp.headers().clone();
            let text = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ApiError>(&text)
                .ok()
                .map(|e| format!("{} ({})", e.error.message, e.error.r#type));
            return Err(InferenceError::from_status(
                &self.provider_id,
                status,
                &headers,
                detail,
            ));
        }

        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| {
                InferenceError::malformed(&self.provider_id, format!("unreadable body: {e}"))
            })?;
        Ok(extract_text(&self.provider_id, body))
    }
}

/// Joined text blocks of a well-formed envelope. An answer with no text is
/// returned as-is and left for the parser to reject.
fn extract_text(provider_id: &str, body: ApiResponse) -> String {
    let text = body
        .content
        .iter()
        .filter(|block| block.block_type == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        tracing::warn!(
            provider = provider_id,
            stop_reason = body.stop_reason.as_deref().unwrap_or("none"),
            "response contained no text"
        );
    }
    if body.stop_reason.as_deref() == Some("max_tokens") {
        tracing::warn!(provider = provider_id, "response hit max_tokens; answer may be truncated");
    }
    text
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub messages: Vec<ApiMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiResponse {
    pub content: Vec<ApiContentBlock>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiErrorDetail {
    #[serde(rename = "type")]
    pub r#type: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PromptMessage;

    #[test]
    fn anthropic_new_trims_trailing_slash() {
        let provider =
            AnthropicProvider::new("test-key", "https://api.anthropic.com/", "claude-sonnet-4-5");
        assert_eq!(provider.api_key, "test-key");
        assert_eq!(provider.api_base, "https://api.anthropic.com");
        assert_eq!(provider.model(), "claude-sonnet-4-5");
    }

    #[test]
    fn api_request_serialization_matches_expected_shape() {
        let provider = AnthropicProvider::new("k", "https://api.anthropic.com", "claude-sonnet-4-5");
        let req = InferenceRequest {
            system: Some("system prompt".to_string()),
            messages: vec![PromptMessage::user("hello")],
            max_tokens: 1024,
            temperature: Some(0.0),
        };

        let value = serde_json::to_value(provider.to_api_request(&req)).unwrap();
        let expected = serde_json::json!({
            "model": "claude-sonnet-4-5",
            "system": "system prompt",
            "max_tokens": 1024,
            "temperature": 0.0,
            "messages": [
                { "role": "user", "content": "hello" }
            ]
        });
        assert_eq!(value, expected);
    }

    #[test]
    fn api_request_without_system_omits_field() {
        let provider = AnthropicProvider::new("k", "https://api.anthropic.com", "m");
        let req = InferenceRequest::simple(None, "hi".into());
        let json = serde_json::to_value(provider.to_api_request(&req)).unwrap();
        assert!(json.get("system").is_none());
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn extract_text_joins_text_blocks() {
        let raw = serde_json::json!({
            "content": [
                {"type": "text", "text": "line 1"},
                {"type": "thinking", "text": "hidden"},
                {"type": "text", "text": "line 2"}
            ],
            "stop_reason": "end_turn"
        });
        let parsed: ApiResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(extract_text("anthropic", parsed), "line 1\nline 2");
    }

    #[test]
    fn extract_text_passes_empty_answer_through() {
        let parsed: ApiResponse =
            serde_json::from_value(serde_json::json!({"content": [], "stop_reason": "end_turn"}))
                .unwrap();
        assert_eq!(extract_text("anthropic", parsed), "");
    }

    #[test]
    fn custom_id_replaces_default_name() {
        let provider = AnthropicProvider::new("k", "https://api.anthropic.com", "m");
        assert_eq!(provider.provider_id(), "anthropic");
        assert_eq!(provider.with_id("claude-eu").provider_id(), "claude-eu");
    }

    #[test]
    fn api_error_deserialization_works() {
        let raw = serde_json::json!({
            "type": "error",
            "error": {
                "type": "invalid_request_error",
                "message": "messages: field required"
            }
        });
        let parsed: ApiError = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.error.r#type, "invalid_request_error");
        assert_eq!(parsed.error.message, "messages: field required");
    }

    #[tokio::test]
    #[ignore]
    async fn integration_real_api_call() {
        let api_key = match std::env::var("ANTHROPIC_API_KEY") {
            Ok(api_key) if !api_key.is_empty() => api_key,
            _ => return,
        };
        let provider =
            AnthropicProvider::new(api_key, "https://api.anthropic.com", "claude-3-5-haiku-latest");
        let request = InferenceRequest::simple(
            Some("Reply with exactly: pong".to_string()),
            "ping".to_string(),
        );
        let text = provider
            .submit(&request, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!text.trim().is_empty());
    }
}
