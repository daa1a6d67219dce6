pub mod anthropic;
pub mod error;
pub mod openai;
pub mod openai_compat;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use anthropic::AnthropicProvider;
pub use error::{InferenceError, ProviderErrorKind};
pub use openai::OpenAiProvider;
pub use openai_compat::{custom, ollama, ollama_with_base, openai};
pub use types::*;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// One outbound completion request per `submit`. Clients never retry; the
/// caller owns retry policy.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Stable provider name recorded in provenance.
    fn provider_id(&self) -> &str;
    fn model(&self) -> &str;
    async fn submit(
        &self,
        request: &InferenceRequest,
        timeout: Duration,
    ) -> Result<String, InferenceError>;
    async fn health(&self) -> Result<(), InferenceError> {
        Ok(())
    }
}

// ============================================================
// Provider Configuration
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Ollama,
    /// Custom OpenAI-compatible endpoint
    Custom,
}

impl ProviderType {
    pub fn requires_api_key(&self) -> bool {
        matches!(self, Self::Anthropic | Self::OpenAI)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
            Self::Ollama => "ollama",
            Self::Custom => "custom",
        }
    }
}

/// Everything needed to build one client. The key is resolved by the caller
/// at startup and is never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider ID recorded in provenance (e.g. "anthropic", "my-vllm")
    pub id: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl ProviderConfig {
    pub fn new(provider_type: ProviderType, model: impl Into<String>) -> Self {
        Self {
            id: provider_type.as_str().to_string(),
            provider_type,
            model: model.into(),
            base_url: None,
            api_key: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// Create a client from configuration.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn InferenceClient>> {
    if config.model.trim().is_empty() {
        anyhow::bail!("provider '{}' requires a model", config.id);
    }
    let provider: Arc<dyn InferenceClient> = match config.provider_type {
        ProviderType::Anthropic => {
            let key = require_key(config)?;
            let base_url = config.base_url.as_deref().unwrap_or(ANTHROPIC_BASE_URL);
            Arc::new(AnthropicProvider::new(key, base_url, &config.model).with_id(&config.id))
        }
        ProviderType::OpenAI => {
            let key = require_key(config)?;
            let base_url = config
                .base_url
                .as_deref()
                .unwrap_or(openai_compat::OPENAI_BASE_URL);
            Arc::new(custom(&config.id, Some(key), base_url, &config.model))
        }
        ProviderType::Ollama => {
            let base_url = config
                .base_url
                .as_deref()
                .unwrap_or(openai_compat::OLLAMA_BASE_URL);
            Arc::new(custom(
                &config.id,
                config.api_key.clone(),
                base_url,
                &config.model,
            ))
        }
        ProviderType::Custom => {
            let base_url = config
                .base_url
                .as_ref()
                .ok_or_else(|| anyhow!("custom provider requires base_url"))?;
            Arc::new(custom(
                &config.id,
                config.api_key.clone(),
                base_url,
                &config.model,
            ))
        }
    };
    tracing::debug!(
        provider = provider.provider_id(),
        model = provider.model(),
        "created inference client"
    );
    Ok(provider)
}

fn require_key(config: &ProviderConfig) -> Result<String> {
    config
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| anyhow!("{} requires an api key", config.provider_type.as_str()))
}
