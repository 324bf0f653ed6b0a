//! The normalized unit of streamed (or buffered) content.
//!
//! Upstream chunks arrive as raw SSE bytes, JSON objects, plain strings or
//! already-normalized chunks; everything is folded into [`StreamChunk`]
//! before the processor chain sees it.

use bytes::Bytes;
use chat_protocol::{FinishReason, ToolCall};
use serde_json::{json, Map, Value};
use tracing::warn;

/// Well-known metadata carried alongside a chunk. `extra` is the escape hatch
/// middleware uses to pass hints downstream.
#[derive(Debug, Clone, Default)]
pub struct ChunkMetadata {
    pub id: Option<String>,
    pub model: Option<String>,
    pub created: Option<u64>,
    pub session_id: Option<String>,
    pub stream_id: Option<String>,
    pub expected_json: Option<bool>,
    pub content_type: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub parse_error: bool,
    pub error: bool,
    pub loop_detected: bool,
    pub non_streaming: bool,
    pub extra: Map<String, Value>,
}

/// One unit of streamed or buffered content.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub content: String,
    /// Terminal marker; exactly one chunk per stream carries it.
    pub is_done: bool,
    /// The pipeline aborted the stream (e.g. loop detected); the payload is a
    /// human-readable cancellation message.
    pub is_cancellation: bool,
    pub metadata: ChunkMetadata,
    pub usage: Option<Value>,
    /// The unparsed upstream chunk, kept for diagnostics.
    pub raw: Option<Value>,
}

/// Raw input accepted by the normalizer.
#[derive(Debug, Clone)]
pub enum RawChunk {
    Bytes(Bytes),
    Text(String),
    Value(Value),
    Chunk(StreamChunk),
}

impl From<Bytes> for RawChunk {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<String> for RawChunk {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Value> for RawChunk {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<StreamChunk> for RawChunk {
    fn from(c: StreamChunk) -> Self {
        Self::Chunk(c)
    }
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn done() -> Self {
        Self {
            is_done: true,
            ..Default::default()
        }
    }

    /// Terminal cancellation chunk carrying a human-readable message.
    pub fn cancellation(message: impl Into<String>) -> Self {
        let mut chunk = Self {
            content: message.into(),
            is_done: true,
            is_cancellation: true,
            ..Default::default()
        };
        chunk.metadata.finish_reason = Some(FinishReason::Cancelled);
        chunk
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Whether the chunk carries anything worth forwarding: text, recovered
    /// tool calls, or usage accounting.
    pub fn has_payload(&self) -> bool {
        !self.content.is_empty() || !self.metadata.tool_calls.is_empty() || self.usage.is_some()
    }

    pub fn from_raw(raw: RawChunk) -> Self {
        match raw {
            RawChunk::Bytes(bytes) => Self::from_bytes(&bytes),
            RawChunk::Text(text) => Self::from_text(&text),
            RawChunk::Value(value) => Self::from_value(value),
            RawChunk::Chunk(chunk) => chunk,
        }
    }

    /// Bytes path: UTF-8 decode, strip SSE framing, `[DONE]`, then JSON.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::from_text(text),
            Err(e) => {
                warn!(error = %e, "undecodable chunk bytes");
                let mut chunk = Self::text("");
                chunk.metadata.parse_error = true;
                chunk
            }
        }
    }

    /// String path: SSE prefix, `[DONE]`, JSON, else verbatim text.
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();

        // SSE-framed payloads lose their framing; plain text is verbatim.
        if let Some(rest) = trimmed.strip_prefix("data: ") {
            let payload = rest.trim();
            if payload == "[DONE]" {
                return Self::done();
            }
            if let Ok(value) = serde_json::from_str::<Value>(payload) {
                return Self::from_value(value);
            }
            return Self::text(payload);
        }

        if trimmed == "[DONE]" {
            return Self::done();
        }

        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                return Self::from_value(value);
            }
        }

        Self::text(text)
    }

    /// Object path: the OpenAI chunk shape. Dialect-specific objects are
    /// projected into this shape by the translation service before they get
    /// here.
    pub fn from_value(value: Value) -> Self {
        let mut chunk = Self::default();
        let mut metadata = ChunkMetadata::default();

        if let Some(object) = value.as_object() {
            chunk.is_done = object
                .get("done")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            metadata.id = object
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);
            metadata.model = object
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string);
            metadata.created = object.get("created").and_then(Value::as_u64);
            chunk.usage = object.get("usage").filter(|u| !u.is_null()).cloned();

            if let Some(choice) = object
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|c| c.first())
            {
                let body = choice.get("delta").or_else(|| choice.get("message"));
                if let Some(body) = body {
                    if let Some(content) = body.get("content").and_then(Value::as_str) {
                        chunk.content = content.to_string();
                    }
                    if let Some(calls) = body.get("tool_calls") {
                        if let Ok(parsed) =
                            serde_json::from_value::<Vec<ToolCall>>(calls.clone())
                        {
                            metadata.tool_calls = parsed;
                        }
                    }
                } else if let Some(text) = choice.get("text").and_then(Value::as_str) {
                    chunk.content = text.to_string();
                }

                if let Some(reason) = choice.get("finish_reason").filter(|r| !r.is_null()) {
                    metadata.finish_reason = serde_json::from_value(reason.clone()).ok();
                }
            }
        } else if let Some(text) = value.as_str() {
            chunk.content = text.to_string();
        } else {
            metadata.parse_error = true;
        }

        chunk.metadata = metadata;
        chunk.raw = Some(value);
        chunk
    }

    /// Serialize back to an SSE frame (or frames, for a terminal chunk that
    /// still carries content).
    pub fn to_sse_bytes(&self) -> Bytes {
        if self.is_done {
            if self.content.is_empty() && self.metadata.tool_calls.is_empty() {
                return Bytes::from_static(b"data: [DONE]\n\n");
            }
            let frame = self.data_frame();
            return Bytes::from(format!("data: {frame}\n\ndata: [DONE]\n\n"));
        }
        Bytes::from(format!("data: {}\n\n", self.data_frame()))
    }

    fn data_frame(&self) -> Value {
        let mut delta = Map::new();
        delta.insert("content".into(), json!(self.content));
        if !self.metadata.tool_calls.is_empty() {
            delta.insert(
                "tool_calls".into(),
                serde_json::to_value(&self.metadata.tool_calls).unwrap_or(Value::Null),
            );
        }

        let mut choice = Map::new();
        choice.insert("delta".into(), Value::Object(delta));
        if self.is_cancellation {
            choice.insert("finish_reason".into(), json!("cancelled"));
        } else if let Some(reason) = &self.metadata.finish_reason {
            choice.insert(
                "finish_reason".into(),
                serde_json::to_value(reason).unwrap_or(Value::Null),
            );
        }

        let mut frame = Map::new();
        frame.insert("choices".into(), json!([Value::Object(choice)]));
        if let Some(id) = &self.metadata.id {
            frame.insert("id".into(), json!(id));
        }
        if let Some(model) = &self.metadata.model {
            frame.insert("model".into(), json!(model));
        }
        if let Some(created) = self.metadata.created {
            frame.insert("created".into(), json!(created));
        }
        if let Some(usage) = &self.usage {
            frame.insert("usage".into(), usage.clone());
        }
        Value::Object(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_done_marker_from_bytes() {
        let chunk = StreamChunk::from_bytes(b"data: [DONE]\n\n");
        assert!(chunk.is_done);
        assert!(chunk.content.is_empty());
    }

    #[test]
    fn test_openai_chunk_from_sse_bytes() {
        let raw = br#"data: {"id":"chatcmpl-1","model":"gpt-4o","created":1700000000,"choices":[{"delta":{"content":"Hi"}}]}"#;
        let chunk = StreamChunk::from_bytes(raw);
        assert_eq!(chunk.content, "Hi");
        assert_eq!(chunk.metadata.id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(chunk.metadata.model.as_deref(), Some("gpt-4o"));
        assert_eq!(chunk.metadata.created, Some(1700000000));
    }

    #[test]
    fn test_message_shape_and_usage() {
        let chunk = StreamChunk::from_value(json!({
            "choices": [{"message": {"content": "buffered"}}],
            "usage": {"total_tokens": 5}
        }));
        assert_eq!(chunk.content, "buffered");
        assert_eq!(chunk.usage.unwrap()["total_tokens"], 5);
    }

    #[test]
    fn test_plain_text_fallback() {
        let chunk = StreamChunk::from_bytes(b"data: not json at all");
        assert_eq!(chunk.content, "not json at all");
        assert!(!chunk.is_done);
    }

    #[test]
    fn test_invalid_utf8_is_nonfatal() {
        let chunk = StreamChunk::from_bytes(&[0xff, 0xfe, 0x00]);
        assert!(chunk.metadata.parse_error);
        assert!(chunk.content.is_empty());
    }

    #[test]
    fn test_sse_round_trip_preserves_content_and_metadata() {
        let raw = json!({
            "id": "chatcmpl-7",
            "model": "gpt-4o",
            "created": 1700000001u64,
            "choices": [{"delta": {"content": "round trip"}}]
        });
        let chunk = StreamChunk::from_value(raw);
        let bytes = chunk.to_sse_bytes();
        let reparsed = StreamChunk::from_bytes(&bytes);
        assert_eq!(reparsed.content, "round trip");
        assert_eq!(reparsed.metadata.id.as_deref(), Some("chatcmpl-7"));
        assert_eq!(reparsed.metadata.model.as_deref(), Some("gpt-4o"));
        assert_eq!(reparsed.metadata.created, Some(1700000001));
    }

    #[test]
    fn test_cancellation_frame() {
        let chunk = StreamChunk::cancellation("[Response cancelled]");
        let text = String::from_utf8(chunk.to_sse_bytes().to_vec()).unwrap();
        assert!(text.contains("\"finish_reason\":\"cancelled\""));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn test_terminal_chunk_without_content() {
        assert_eq!(
            StreamChunk::done().to_sse_bytes(),
            Bytes::from_static(b"data: [DONE]\n\n")
        );
    }
}
