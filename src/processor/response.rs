//! The response processor: buffered and streaming dispatch.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use loop_detection::HybridLoopDetector;
use serde_json::{json, Map, Value};
use tracing::error;

use super::ProcessedResponse;
use crate::error::ProxyError;
use crate::middleware::{MiddlewareApplicationManager, MiddlewareContext, ResponseKind};
use crate::session::SessionStore;
use crate::streaming::{RawChunk, StreamChunk, StreamContext, StreamNormalizer};

/// Per-request hints that gate JSON handling and schema validation.
#[derive(Debug, Clone, Default)]
pub struct ResponseHints {
    pub expected_json: Option<bool>,
    pub content_type: Option<String>,
    pub response_schema: Option<Value>,
}

/// Owns the two top-level operations: `process_response` (buffered) and
/// `process_streaming`.
pub struct ResponseProcessor {
    normalizer: Arc<StreamNormalizer>,
    manager: Arc<MiddlewareApplicationManager>,
    sessions: Arc<SessionStore>,
}

impl ResponseProcessor {
    pub fn new(
        normalizer: Arc<StreamNormalizer>,
        manager: Arc<MiddlewareApplicationManager>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            normalizer,
            manager,
            sessions,
        }
    }

    /// Buffered path: extract text content, check for loops, run the
    /// middleware chain once over the full content.
    pub async fn process_response(
        &self,
        response: Value,
        session_id: &str,
        hints: &ResponseHints,
    ) -> Result<ProcessedResponse, ProxyError> {
        let (content, usage, mut metadata) = extract_content(&response);

        let loop_config = self.sessions.loop_config(session_id);
        if loop_config.loop_detection_enabled {
            let result = HybridLoopDetector::default().check_for_loops(&content);
            if result.has_loop {
                return Err(ProxyError::LoopDetected {
                    pattern: result.pattern.unwrap_or_default(),
                    repetitions: result.repetitions.unwrap_or(0),
                });
            }
        }

        let mut context = MiddlewareContext::new(session_id, self.sessions.clone());
        context.response_kind = ResponseKind::NonStreaming;
        context.content_type = hints.content_type.clone();
        context.response_schema = hints.response_schema.clone();
        context.expected_json = hints
            .expected_json
            .or_else(|| infer_expected_json(&content, hints).then_some(true));

        let response = ProcessedResponse {
            content,
            usage,
            metadata: std::mem::take(&mut metadata),
        };
        self.manager.apply(response, &context).await
    }

    /// Streaming path: wrap the source in the normalizer and yield one
    /// [`ProcessedResponse`] per emitted chunk. Pipeline failures surface as
    /// a final item with `metadata.error = true`, never as a mid-iteration
    /// raise.
    pub fn process_streaming(
        &self,
        source: BoxStream<'static, RawChunk>,
        session_id: &str,
        hints: &ResponseHints,
    ) -> BoxStream<'static, ProcessedResponse> {
        let context = self.stream_context(session_id, hints);
        self.normalizer
            .process_stream(source, context)
            .map(chunk_to_processed)
            .boxed()
    }

    /// Streaming path emitted as SSE frames for the transport.
    pub fn process_streaming_bytes(
        &self,
        source: BoxStream<'static, RawChunk>,
        session_id: &str,
        hints: &ResponseHints,
    ) -> BoxStream<'static, Bytes> {
        let context = self.stream_context(session_id, hints);
        self.normalizer
            .process_stream_bytes(source, context)
            .boxed()
    }

    fn stream_context(&self, session_id: &str, hints: &ResponseHints) -> StreamContext {
        let loop_config = self.sessions.loop_config(session_id);
        StreamContext {
            session_id: Some(session_id.to_string()),
            expected_json: hints.expected_json,
            content_type: hints.content_type.clone(),
            response_schema: hints.response_schema.clone(),
            loop_detection_enabled: Some(loop_config.loop_detection_enabled),
        }
    }
}

fn chunk_to_processed(chunk: StreamChunk) -> ProcessedResponse {
    let mut metadata = chunk.metadata.extra.clone();
    if let Some(id) = &chunk.metadata.id {
        metadata.insert("id".into(), json!(id));
    }
    if let Some(model) = &chunk.metadata.model {
        metadata.insert("model".into(), json!(model));
    }
    if let Some(created) = chunk.metadata.created {
        metadata.insert("created".into(), json!(created));
    }
    metadata.insert("is_done".into(), json!(chunk.is_done));
    if chunk.is_cancellation {
        metadata.insert("is_cancellation".into(), json!(true));
    }
    if chunk.metadata.error {
        metadata.insert("error".into(), json!(true));
    }
    if !chunk.metadata.tool_calls.is_empty() {
        metadata.insert(
            "tool_calls".into(),
            serde_json::to_value(&chunk.metadata.tool_calls).unwrap_or(Value::Null),
        );
    }

    ProcessedResponse {
        content: chunk.content,
        usage: chunk.usage,
        metadata,
    }
}

/// Pull text content out of the supported buffered response shapes: a chat
/// completion body, a bare string, or anything else stringified.
fn extract_content(response: &Value) -> (String, Option<Value>, Map<String, Value>) {
    let mut metadata = Map::new();

    match response {
        Value::Object(object) => {
            if let Some(id) = object.get("id") {
                metadata.insert("id".into(), id.clone());
            }
            if let Some(model) = object.get("model") {
                metadata.insert("model".into(), model.clone());
            }
            if let Some(created) = object.get("created") {
                metadata.insert("created".into(), created.clone());
            }

            let mut content = String::new();
            if let Some(choice) = object
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|choices| choices.first())
            {
                let message = choice.get("message").or_else(|| choice.get("delta"));
                if let Some(message) = message {
                    if let Some(text) = message.get("content").and_then(Value::as_str) {
                        content = text.to_string();
                    }
                    if let Some(calls) = message.get("tool_calls").filter(|c| !c.is_null()) {
                        metadata.insert("tool_calls".into(), calls.clone());
                    }
                }
            } else if let Some(text) = object.get("content").and_then(Value::as_str) {
                content = text.to_string();
            }

            let usage = object.get("usage").filter(|u| !u.is_null()).cloned();
            (content, usage, metadata)
        }
        Value::String(text) => (text.clone(), None, metadata),
        other => {
            error!("unsupported buffered response shape: {}", other);
            (other.to_string(), None, metadata)
        }
    }
}

fn infer_expected_json(content: &str, hints: &ResponseHints) -> bool {
    if hints
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"))
    {
        return true;
    }
    let trimmed = content.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopDetectionConfiguration;
    use crate::middleware::MiddlewareApplicationManager;
    use futures::stream;

    fn processor() -> ResponseProcessor {
        let sessions = Arc::new(SessionStore::new(LoopDetectionConfiguration::default()));
        ResponseProcessor::new(
            Arc::new(StreamNormalizer::new(vec![])),
            Arc::new(MiddlewareApplicationManager::new(vec![])),
            sessions,
        )
    }

    #[tokio::test]
    async fn test_buffered_chat_completion_extraction() {
        let p = processor();
        let body = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "created": 1700000000u64,
            "choices": [{"message": {"content": "hello there"}}],
            "usage": {"total_tokens": 3}
        });
        let out = p
            .process_response(body, "s", &ResponseHints::default())
            .await
            .unwrap();
        assert_eq!(out.content, "hello there");
        assert_eq!(out.metadata["model"], json!("gpt-4o"));
        assert_eq!(out.usage.unwrap()["total_tokens"], 3);
    }

    #[tokio::test]
    async fn test_buffered_loop_raises() {
        let p = processor();
        let looping = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN".repeat(12);
        let err = p
            .process_response(Value::String(looping), "s", &ResponseHints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::LoopDetected { .. }));
    }

    #[tokio::test]
    async fn test_streaming_yields_processed_responses() {
        let p = processor();
        let source = stream::iter(vec![
            RawChunk::Text("chunk one ".into()),
            RawChunk::Text("chunk two".into()),
        ])
        .boxed();
        let out: Vec<ProcessedResponse> = p
            .process_streaming(source, "s", &ResponseHints::default())
            .collect()
            .await;
        assert!(out.iter().any(|r| r.content.contains("chunk one")));
        assert_eq!(out.last().unwrap().metadata["is_done"], json!(true));
    }
}
