//! Ingress handlers for the three chat dialects.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chat_protocol::{ChatCompletionRequest, FinishReason};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::error::ProxyError;
use crate::processor::{ProcessedResponse, RequestOutcome};

const SESSION_HEADER: &str = "x-session-id";

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ProxyError> {
    let mut data = Vec::new();
    for (name, connector) in state.connectors.backends() {
        match connector.list_models().await {
            Ok(models) => {
                for model in models {
                    data.push(json!({
                        "id": model,
                        "object": "model",
                        "owned_by": name,
                    }));
                }
            }
            Err(e) => debug!(backend = %name, error = %e, "model listing failed"),
        }
    }
    Ok(Json(json!({ "object": "list", "data": data })))
}

/// `POST /v1/chat/completions` — the canonical dialect.
pub async fn openai_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ProxyError> {
    let request: ChatCompletionRequest = serde_json::from_value(body)
        .map_err(|e| ProxyError::validation(format!("invalid chat completion request: {e}")))?;
    if request.model.is_empty() {
        return Err(ProxyError::validation("model is required"));
    }

    let session_id = session_id_from(&headers);
    let model = request.model.clone();

    match state.requests.execute(request, &session_id).await? {
        RequestOutcome::Streaming { stream, media_type } => Ok(sse_response(stream, &media_type)),
        RequestOutcome::Buffered(processed) => {
            Ok(Json(openai_completion_body(&processed, &model)).into_response())
        }
    }
}

/// `POST /v1/anthropic/messages` — Anthropic Messages dialect.
pub async fn anthropic_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ProxyError> {
    let request = state.translation.anthropic_to_canonical(body)?;
    let session_id = session_id_from(&headers);
    let model = request.model.clone();

    match state.requests.execute(request, &session_id).await? {
        RequestOutcome::Streaming { stream, media_type } => Ok(sse_response(stream, &media_type)),
        RequestOutcome::Buffered(processed) => Ok(Json(
            state.translation.canonical_to_anthropic(&processed, &model),
        )
        .into_response()),
    }
}

/// `POST /gemini/v1beta/models/{model}:generateContent` and
/// `:streamGenerateContent`.
pub async fn gemini_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ProxyError> {
    let (model, action) = model_action.split_once(':').ok_or_else(|| {
        ProxyError::validation("expected {model}:generateContent or {model}:streamGenerateContent")
    })?;
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(ProxyError::validation(format!(
                "unsupported Gemini action: {other}"
            )))
        }
    };

    let request = state.translation.gemini_to_canonical(model, body, stream)?;
    let session_id = session_id_from(&headers);

    match state.requests.execute(request, &session_id).await? {
        RequestOutcome::Streaming { stream, media_type } => Ok(sse_response(stream, &media_type)),
        RequestOutcome::Buffered(processed) => Ok(Json(
            state.translation.canonical_to_gemini(&processed, model),
        )
        .into_response()),
    }
}

fn session_id_from(headers: &HeaderMap) -> String {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
}

fn sse_response(
    stream: futures::stream::BoxStream<'static, bytes::Bytes>,
    media_type: &str,
) -> Response {
    let body = Body::from_stream(stream.map(Ok::<_, std::convert::Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, media_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|e| {
            ProxyError::internal(format!("cannot build stream response: {e}")).into_response()
        })
}

/// Assemble the OpenAI completion envelope from a processed response.
fn openai_completion_body(processed: &ProcessedResponse, model: &str) -> Value {
    let tool_calls = processed.tool_calls();
    let finish_reason = if tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolCalls
    };

    let mut message = json!({
        "role": "assistant",
        "content": processed.content,
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = serde_json::to_value(&tool_calls).unwrap_or(Value::Null);
    }

    json!({
        "id": processed
            .metadata
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| chat_protocol::generate_id("chatcmpl-")),
        "object": "chat.completion",
        "created": processed
            .metadata
            .get("created")
            .and_then(Value::as_u64)
            .unwrap_or_else(|| Utc::now().timestamp() as u64),
        "model": processed
            .metadata
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model),
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": processed.usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_completion_body_shape() {
        let mut processed = ProcessedResponse::text("answer");
        processed.metadata.insert("model".into(), json!("gpt-4o"));
        let body = openai_completion_body(&processed, "fallback");
        assert_eq!(body["choices"][0]["message"]["content"], "answer");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["object"], "chat.completion");
    }

    #[test]
    fn test_tool_calls_switch_finish_reason() {
        let mut processed = ProcessedResponse::text("");
        processed.metadata.insert(
            "tool_calls".into(),
            json!([{"id": "call_1", "type": "function",
                    "function": {"name": "f", "arguments": "{}"}}]),
        );
        let body = openai_completion_body(&processed, "m");
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            body["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "f"
        );
    }
}
