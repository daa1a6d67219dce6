use std::time::Duration;

use rolelens_provider::{
    AnthropicProvider, InferenceClient, InferenceRequest, OpenAiProvider, ProviderErrorKind,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

fn mock_openai_response(text: &str) -> serde_json::Value {
    serde_json::json!({
        "choices": [{
            "message": {"content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5}
    })
}

fn mock_openai_error(status: u16, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(serde_json::json!({
        "error": {
            "type": "api_error",
            "message": message
        }
    }))
}

fn mock_anthropic_response(text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "msg_01",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 20, "output_tokens": 7}
    })
}

fn request() -> InferenceRequest {
    InferenceRequest::simple(Some("classify".into()), "transcript".into())
}

#[tokio::test]
async fn openai_submit_sends_bearer_and_returns_content() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(serde_json::json!({"model": "gpt-4o"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(mock_openai_response("{\"ok\": true}")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("openai", Some("test-key".into()), server.uri(), "gpt-4o");
    let text = provider.submit(&request(), TIMEOUT).await.unwrap();
    assert_eq!(text, "{\"ok\": true}");
}

#[tokio::test]
async fn ollama_preset_sends_no_authorization_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_openai_response("hi")))
        .expect(1)
        .mount(&server)
        .await;

    let provider = rolelens_provider::ollama_with_base(server.uri(), "llama3.1:8b");
    provider.submit(&request(), TIMEOUT).await.unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(!received[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn rate_limit_maps_to_rate_limit_error_with_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(mock_openai_error(429, "slow down").insert_header("retry-after", "3"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("openai", Some("k".into()), server.uri(), "gpt-4o");
    let err = provider.submit(&request(), TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind(), ProviderErrorKind::RateLimit);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    assert!(err.to_string().contains("slow down"));
}

#[tokio::test]
async fn unauthorized_maps_to_authentication_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(mock_openai_error(401, "invalid api key"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("openai", Some("bad".into()), server.uri(), "gpt-4o");
    let err = provider.submit(&request(), TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind(), ProviderErrorKind::Authentication);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_error_maps_to_network_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(mock_openai_error(500, "boom"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("openai", Some("k".into()), server.uri(), "gpt-4o");
    let err = provider.submit(&request(), TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind(), ProviderErrorKind::Network);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn bad_request_maps_to_backend_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(mock_openai_error(400, "unknown model"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("openai", Some("k".into()), server.uri(), "nope");
    let err = provider.submit(&request(), TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind(), ProviderErrorKind::Backend);
    assert!(err.to_string().contains("(400)"));
    assert!(err.to_string().contains("unknown model"));
}

#[tokio::test]
async fn slow_backend_times_out_as_network_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(mock_openai_response("late"))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("openai", Some("k".into()), server.uri(), "gpt-4o");
    let err = provider
        .submit(&request(), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ProviderErrorKind::Network);
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn malformed_body_maps_to_backend_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("openai", Some("k".into()), server.uri(), "gpt-4o");
    let err = provider.submit(&request(), TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind(), ProviderErrorKind::Backend);
}

#[tokio::test]
async fn anthropic_submit_sends_version_and_key_headers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "ant-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "system": "classify"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(mock_anthropic_response("{\"a\": 1}")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new("ant-key", server.uri(), "claude-sonnet-4-5");
    let text = provider.submit(&request(), TIMEOUT).await.unwrap();
    assert_eq!(text, "{\"a\": 1}");
    assert_eq!(provider.provider_id(), "anthropic");
}

#[tokio::test]
async fn anthropic_overloaded_is_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(serde_json::json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new("k", server.uri(), "claude-sonnet-4-5");
    let err = provider.submit(&request(), TIMEOUT).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("overloaded_error"));
}

#[tokio::test]
async fn anthropic_forbidden_is_authentication_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "type": "error",
            "error": {"type": "permission_error", "message": "no access"}
        })))
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new("k", server.uri(), "claude-sonnet-4-5");
    let err = provider.submit(&request(), TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind(), ProviderErrorKind::Authentication);
}

#[tokio::test]
async fn anthropic_empty_answer_is_returned_not_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "msg_02",
            "type": "message",
            "role": "assistant",
            "content": [],
            "stop_reason": "end_turn"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new("k", server.uri(), "claude-sonnet-4-5");
    let text = provider.submit(&request(), TIMEOUT).await.unwrap();
    assert!(text.is_empty());
}

#[tokio::test]
async fn anthropic_unreadable_envelope_is_backend_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new("k", server.uri(), "claude-sonnet-4-5");
    let err = provider.submit(&request(), TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind(), ProviderErrorKind::Backend);
}
