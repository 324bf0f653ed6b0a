//! OpenAI Chat Completions protocol definitions (`/v1/chat/completions`).
//!
//! These are the canonical request/response shapes inside the proxy. Dialect
//! ingress (Anthropic, Gemini) is translated into these types before any
//! processing happens.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::*;

// ============================================================================
// Request Types
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// ID of the model to use. May carry a backend prefix (`openrouter:gpt-4o`)
    /// which the gateway strips before dispatch.
    pub model: String,

    /// The conversation so far.
    pub messages: Vec<ChatMessage>,

    /// What sampling temperature to use.
    pub temperature: Option<f32>,

    /// Nucleus sampling parameter.
    pub top_p: Option<f32>,

    /// The maximum number of tokens to generate.
    pub max_tokens: Option<u32>,

    /// Whether to stream back partial progress.
    #[serde(default)]
    pub stream: bool,

    /// Up to 4 sequences where the API will stop generating further tokens.
    pub stop: Option<StringOrArray>,

    /// Tools the model may call.
    pub tools: Option<Vec<Tool>>,

    /// Forced tool choice, passed through verbatim.
    pub tool_choice: Option<Value>,

    /// Structured-output request (`{"type":"json_schema", …}`), passed through
    /// and also consulted by the gateway's schema-validation gate.
    pub response_format: Option<Value>,

    /// A unique identifier representing the end-user.
    pub user: Option<String>,

    /// Anything else the caller sent; forwarded to the backend untouched.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl ChatCompletionRequest {
    /// Extract the JSON schema from `response_format` when the caller asked
    /// for structured output.
    pub fn response_schema(&self) -> Option<&Value> {
        let format = self.response_format.as_ref()?;
        if format.get("type").and_then(Value::as_str) != Some("json_schema") {
            return None;
        }
        format
            .get("json_schema")
            .and_then(|js| js.get("schema"))
            .or_else(|| format.get("schema"))
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,

    /// Message text. Absent for pure tool-call assistant turns.
    pub content: Option<String>,

    /// Structured tool calls attached to an assistant turn.
    pub tool_calls: Option<Vec<ToolCall>>,

    /// For `tool` role messages, the id of the call being answered.
    pub tool_call_id: Option<String>,

    pub name: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String, // "chat.completion"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Option<Usage>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: Option<FinishReason>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: Role,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionStreamResponse {
    pub id: String,
    pub object: String, // "chat.completion.chunk"
    pub created: u64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
    pub usage: Option<Usage>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<FinishReason>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip_preserves_unknown_fields() {
        let raw = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "seed": 7,
            "logit_bias": {"50256": -100}
        });
        let req: ChatCompletionRequest = serde_json::from_value(raw.clone()).unwrap();
        assert!(req.stream);
        assert_eq!(req.other["seed"], json!(7));
        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["logit_bias"], raw["logit_bias"]);
    }

    #[test]
    fn test_response_schema_extraction() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [],
            "response_format": {
                "type": "json_schema",
                "json_schema": {"name": "out", "schema": {"type": "object"}}
            }
        }))
        .unwrap();
        assert_eq!(req.response_schema(), Some(&json!({"type": "object"})));

        let plain: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [],
            "response_format": {"type": "text"}
        }))
        .unwrap();
        assert!(plain.response_schema().is_none());
    }

    #[test]
    fn test_stream_chunk_deserialization() {
        let chunk: ChatCompletionStreamResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1700000000u64,
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"content": "Hello"}, "finish_reason": null}]
        }))
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hello"));
    }
}
