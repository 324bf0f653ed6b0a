//! In-process HTTP tests: the router, the OpenAI-shaped error contract and
//! the tool-call-loop surface, driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use chat_protocol::ChatCompletionRequest;
use lpg::config::LoopDetectionConfiguration;
use lpg::connectors::{
    BackendConnector, BackendResponse, ConnectorCapabilities, ConnectorRegistry, ResponseEnvelope,
};
use lpg::middleware::{
    EmptyResponseMiddleware, LoggingMiddleware, MiddlewareApplicationManager, ResponseMiddleware,
    ToolCallLoopDetectionMiddleware,
};
use lpg::processor::{RequestProcessor, ResponseProcessor};
use lpg::server::{build_router, AppState};
use lpg::session::SessionStore;
use lpg::streaming::StreamNormalizer;
use lpg::translation::DialectTranslation;
use lpg::ProxyError;

/// Always answers with the same chat completion body.
struct StaticBackend {
    body: Value,
}

#[async_trait]
impl BackendConnector for StaticBackend {
    fn name(&self) -> &'static str {
        "static"
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_oauth: false,
            supports_streaming: false,
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ProxyError> {
        Ok(vec!["static-1".to_string()])
    }

    async fn chat_completions(
        &self,
        _request: &ChatCompletionRequest,
        _effective_model: &str,
    ) -> Result<BackendResponse, ProxyError> {
        Ok(BackendResponse::Buffered(ResponseEnvelope {
            content: self.body.clone(),
            headers: HeaderMap::new(),
            status: StatusCode::OK,
        }))
    }
}

fn app_with_backend(body: Value) -> axum::Router {
    let sessions = Arc::new(SessionStore::new(LoopDetectionConfiguration::default()));
    let middleware: Vec<Arc<dyn ResponseMiddleware>> = vec![
        Arc::new(LoggingMiddleware),
        Arc::new(ToolCallLoopDetectionMiddleware),
        Arc::new(EmptyResponseMiddleware::new(true, 1)),
    ];
    let manager = Arc::new(MiddlewareApplicationManager::new(middleware));
    let responses = Arc::new(ResponseProcessor::new(
        Arc::new(StreamNormalizer::new(vec![])),
        manager,
        sessions.clone(),
    ));

    let mut registry = ConnectorRegistry::new("static");
    registry.register(Arc::new(StaticBackend { body }));
    let connectors = Arc::new(registry);

    let requests = Arc::new(RequestProcessor::new(
        connectors.clone(),
        responses,
        sessions.clone(),
        1,
    ));

    build_router(AppState {
        requests,
        connectors,
        sessions,
        translation: Arc::new(DialectTranslation),
    })
}

fn chat_body() -> Value {
    json!({
        "id": "chatcmpl-static",
        "model": "static-1",
        "created": 1700000000u64,
        "choices": [{"message": {"content": "hello from upstream"}}],
        "usage": {"total_tokens": 4}
    })
}

async fn post_json(app: &axum::Router, uri: &str, body: Value, session: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-session-id", session)
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let app = app_with_backend(chat_body());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_chat_completion_round_trip() {
    let app = app_with_backend(chat_body());
    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({"model": "static-1", "messages": [{"role": "user", "content": "hi"}]}),
        "s1",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "hello from upstream"
    );
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "static-1");
}

#[tokio::test]
async fn test_invalid_request_gets_openai_shaped_error() {
    let app = app_with_backend(chat_body());
    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({"messages": "not an array"}),
        "s1",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["choices"][0]["finish_reason"], "error");
    assert!(body["error"]["message"].as_str().unwrap().len() > 0);
}

#[tokio::test]
async fn test_tool_call_loop_maps_to_400_with_structured_body() {
    let looping_body = json!({
        "id": "chatcmpl-static",
        "model": "static-1",
        "created": 1700000000u64,
        "choices": [{"message": {
            "content": "calling",
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "hello", "arguments": "{\"x\":1}"}
            }]
        }}]
    });
    let app = app_with_backend(looping_body);

    let request = json!({"model": "static-1", "messages": [{"role": "user", "content": "go"}]});
    for _ in 0..3 {
        let (status, _) = post_json(&app, "/v1/chat/completions", request.clone(), "loop").await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = post_json(&app, "/v1/chat/completions", request, "loop").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "tool_call_loop_detected");
    assert_eq!(body["error"]["details"]["repetitions"], 4);
    assert_eq!(body["choices"][0]["finish_reason"], "error");
}

#[tokio::test]
async fn test_anthropic_ingress_translates() {
    let app = app_with_backend(chat_body());
    let (status, body) = post_json(
        &app,
        "/v1/anthropic/messages",
        json!({
            "model": "static-1",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}]
        }),
        "s2",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["text"], "hello from upstream");
}

#[tokio::test]
async fn test_gemini_ingress_translates() {
    let app = app_with_backend(chat_body());
    let (status, body) = post_json(
        &app,
        "/gemini/v1beta/models/static-1:generateContent",
        json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}),
        "s3",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["candidates"][0]["content"]["parts"][0]["text"],
        "hello from upstream"
    );
}

#[tokio::test]
async fn test_models_listing() {
    let app = app_with_backend(chat_body());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["data"][0]["id"], "static-1");
    assert_eq!(body["data"][0]["owned_by"], "static");
}
