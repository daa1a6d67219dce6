//! Presets for backends that speak the OpenAI chat-completions protocol.

use crate::OpenAiProvider;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// Hosted OpenAI.
pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> OpenAiProvider {
    OpenAiProvider::new("openai", Some(api_key.into()), OPENAI_BASE_URL, model)
}

/// Local Ollama server on the default port.
pub fn ollama(model: impl Into<String>) -> OpenAiProvider {
    ollama_with_base(OLLAMA_BASE_URL, model)
}

/// Ollama with a custom base URL. No credential is sent.
pub fn ollama_with_base(base_url: impl Into<String>, model: impl Into<String>) -> OpenAiProvider {
    OpenAiProvider::new("ollama", None, base_url, model)
}

/// Any other OpenAI-compatible endpoint (vLLM, LM Studio, llama.cpp server, ...).
pub fn custom(
    provider_id: impl Into<String>,
    api_key: Option<String>,
    base_url: impl Into<String>,
    model: impl Into<String>,
) -> OpenAiProvider {
    OpenAiProvider::new(provider_id, api_key, base_url, model)
}
