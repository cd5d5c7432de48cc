//! Integration tests for `HttpProvider` against mocked provider APIs.
//!
//! Covers:
//! - Request shape per provider (path, auth headers, body)
//! - Response text extraction
//! - HTTP status classification (429/5xx transient, 4xx permanent)
//! - Request timeout and caller cancellation
//! - End-to-end dispatch through `HybridScheduler`

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hybrid_scheduler::config::{ProviderKind, SchedulerConfig};
use hybrid_scheduler::{
    ErrorKind, HttpProvider, HybridScheduler, InMemoryTaskStore, InvocationOutcome,
    InvocationPayload, ProviderErrorKind, ProviderInvoker, RequestState, TenantId,
};

// ============================================================================
// Helpers
// ============================================================================

fn provider(kind: ProviderKind, server: &MockServer) -> HttpProvider {
    HttpProvider::new(kind, "test-key")
        .expect("test: provider")
        .with_base_url(server.uri())
        .with_timeout(Duration::from_secs(5))
}

fn payload(model: &str) -> InvocationPayload {
    InvocationPayload::new(model, "hello there")
}

fn openai_body(text: &str) -> serde_json::Value {
    json!({"choices": [{"message": {"role": "assistant", "content": text}}]})
}

async fn invoke(p: &HttpProvider, model: &str) -> InvocationOutcome {
    p.invoke(&payload(model), CancellationToken::new()).await
}

fn failure_kind(outcome: InvocationOutcome) -> ProviderErrorKind {
    match outcome {
        InvocationOutcome::Failure(e) => e.kind,
        other => panic!("expected failure, got {other:?}"),
    }
}

// ============================================================================
// Request shape and extraction
// ============================================================================

#[tokio::test]
async fn test_openai_sends_bearer_chat_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hello there"}],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_body("hi!")))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = invoke(&provider(ProviderKind::OpenAi, &server), "gpt-4o").await;
    assert_eq!(outcome, InvocationOutcome::Success("hi!".to_string()));
}

#[tokio::test]
async fn test_deepseek_uses_openai_wire_format() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_body("deep")))
        .mount(&server)
        .await;

    let p = provider(ProviderKind::DeepSeek, &server);
    assert_eq!(p.name(), "deepseek");
    let outcome = invoke(&p, "deepseek-chat").await;
    assert_eq!(outcome, InvocationOutcome::Success("deep".to_string()));
}

#[tokio::test]
async fn test_anthropic_sends_api_key_and_version() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({"model": "claude-sonnet"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "bonjour"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = invoke(&provider(ProviderKind::Anthropic, &server), "claude-sonnet").await;
    assert_eq!(outcome, InvocationOutcome::Success("bonjour".to_string()));
}

#[tokio::test]
async fn test_gemini_sends_key_as_query_parameter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-pro:generateContent"))
        .and(query_param("key", "test-key"))
        .and(body_partial_json(json!({
            "contents": [{"parts": [{"text": "hello there"}]}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"parts": [{"text": "hola"}]}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = invoke(&provider(ProviderKind::Gemini, &server), "gemini-pro").await;
    assert_eq!(outcome, InvocationOutcome::Success("hola".to_string()));
}

#[tokio::test]
async fn test_payload_options_override_defaults() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"max_tokens": 64})))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_body("short")))
        .expect(1)
        .mount(&server)
        .await;

    let mut payload = payload("gpt-4o");
    payload.options.max_tokens = Some(64);
    let outcome = provider(ProviderKind::OpenAi, &server)
        .invoke(&payload, CancellationToken::new())
        .await;
    assert_eq!(outcome, InvocationOutcome::Success("short".to_string()));
}

#[tokio::test]
async fn test_missing_text_field_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let outcome = invoke(&provider(ProviderKind::OpenAi, &server), "gpt-4o").await;
    assert_eq!(failure_kind(outcome), ProviderErrorKind::Permanent);
}

// ============================================================================
// Status classification
// ============================================================================

#[tokio::test]
async fn test_http_429_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429).set_body_json(
            json!({"error": {"type": "rate_limit_error", "message": "slow down"}}),
        ))
        .mount(&server)
        .await;

    let outcome = invoke(&provider(ProviderKind::Anthropic, &server), "claude-sonnet").await;
    match outcome {
        InvocationOutcome::Failure(e) => {
            assert!(e.is_transient());
            assert!(e.message.contains("429"), "message: {}", e.message);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_http_503_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let outcome = invoke(&provider(ProviderKind::OpenAi, &server), "gpt-4o").await;
    assert_eq!(failure_kind(outcome), ProviderErrorKind::Transient);
}

#[tokio::test]
async fn test_http_401_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let outcome = invoke(&provider(ProviderKind::Gemini, &server), "gemini-pro").await;
    assert_eq!(failure_kind(outcome), ProviderErrorKind::Permanent);
}

#[tokio::test]
async fn test_request_timeout_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(openai_body("late"))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let p = provider(ProviderKind::OpenAi, &server).with_timeout(Duration::from_millis(100));
    let outcome = invoke(&p, "gpt-4o").await;
    assert_eq!(failure_kind(outcome), ProviderErrorKind::Transient);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancellation_aborts_in_flight_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(openai_body("never"))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let p = provider(ProviderKind::OpenAi, &server);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let outcome = p.invoke(&payload("gpt-4o"), cancel).await;
    assert_eq!(outcome, InvocationOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_already_cancelled_token_skips_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_body("x")))
        .expect(0)
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = provider(ProviderKind::OpenAi, &server)
        .invoke(&payload("gpt-4o"), cancel)
        .await;
    assert_eq!(outcome, InvocationOutcome::Cancelled);
}

// ============================================================================
// Through the scheduler
// ============================================================================

#[tokio::test]
async fn test_scheduler_dispatches_realtime_and_task_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_body("from mock")))
        .mount(&server)
        .await;

    let scheduler = HybridScheduler::new(
        SchedulerConfig::default(),
        Arc::new(provider(ProviderKind::OpenAi, &server)),
        Arc::new(InMemoryTaskStore::new()),
    )
    .expect("test: scheduler");

    let text = scheduler
        .submit_realtime(TenantId::new("t"), payload("gpt-4o"))
        .await
        .expect("test: realtime");
    assert_eq!(text, "from mock");

    let id = scheduler
        .submit_task(TenantId::new("t"), payload("gpt-4o"))
        .await
        .expect("test: task");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = scheduler.get_status(id).await.expect("test: status");
        if record.state == RequestState::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task stuck in {}", record.state);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        scheduler.get_result(id).await.expect("test: result").as_deref(),
        Some("from mock")
    );
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_scheduler_surfaces_permanent_http_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown model"))
        .mount(&server)
        .await;

    let scheduler = HybridScheduler::new(
        SchedulerConfig::default(),
        Arc::new(provider(ProviderKind::OpenAi, &server)),
        Arc::new(InMemoryTaskStore::new()),
    )
    .expect("test: scheduler");

    let err = scheduler
        .submit_realtime(TenantId::new("t"), payload("nope"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderPermanent);
    scheduler.shutdown().await;
}
