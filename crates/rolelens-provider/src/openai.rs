use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{InferenceClient, InferenceError, InferenceRequest};

/// Backend speaking the OpenAI chat-completions protocol. Used for hosted
/// OpenAI as well as local model servers that expose the same API.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    provider_id: String,
    api_key: Option<String>,
    api_base: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: Option<String>,
        api_base: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            provider_id: provider_id.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    pub(crate) fn to_api_request(&self, request: &InferenceRequest) -> ApiRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(ApiMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| ApiMessage {
            role: m.role.clone(),
            content: m.content.clone(),
        }));

        ApiRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(request.max_tokens),
            temperature: request.temperature,
        }
    }
}

#[async_trait]
impl InferenceClient for OpenAiProvider {
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
        let url = format!("{}/chat/completions", self.api_base);
        let payload = self.to_api_request(request);

        let mut req = self
            .client
            .post(url)
            .timeout(timeout)
            .header("content-type", "application/json")
            .json(&payload);
        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| InferenceError::from_transport(&self.provider_id, e, timeout))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let headers = resp.headers().clone();
            let text = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ApiErrorEnvelope>(&text)
                .ok()
                .map(|e| e.error.message);
            return Err(InferenceError::from_status(
                &self.provider_id,
                status,
                &headers,
                detail,
            ));
        }

        let body: ApiResponse = resp.json().await.map_err(|e| {
            InferenceError::malformed(&self.provider_id, format!("unreadable body: {e}"))
        })?;
        extract_text(&self.provider_id, body)
    }

    async fn health(&self) -> Result<(), InferenceError> {
        let url = format!("{}/models", self.api_base);
        let timeout = Duration::from_secs(5);
        let mut req = self.client.get(url).timeout(timeout);
        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| InferenceError::from_transport(&self.provider_id, e, timeout))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(InferenceError::from_status(
                &self.provider_id,
                status,
                resp.headers(),
                None,
            ));
        }
        Ok(())
    }
}

fn extract_text(provider_id: &str, body: ApiResponse) -> Result<String, InferenceError> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::malformed(provider_id, "empty choices"))?;
    if choice.finish_reason.as_deref() == Some("length") {
        tracing::warn!(provider = provider_id, "response hit max_tokens; answer may be truncated");
    }
    let text = choice.message.content.unwrap_or_default();
    if text.trim().is_empty() {
        tracing::warn!(provider = provider_id, "response contained no text");
    }
    Ok(text)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiRequest {
    pub model: String,
    pub messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiResponse {
    pub choices: Vec<ApiChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiChoice {
    pub message: ApiResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiErrorEnvelope {
    pub error: ApiErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub message: String,
}
