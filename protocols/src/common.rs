//! Types shared between the request and response sides of the chat API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A value that may be a single string or an array of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrArray {
    String(String),
    Array(Vec<String>),
}

impl StringOrArray {
    /// Flatten to a single text blob, joining array elements with a space.
    pub fn joined(&self) -> String {
        match self {
            StringOrArray::String(s) => s.clone(),
            StringOrArray::Array(v) => v.join(" "),
        }
    }
}

/// Conversation role. Unknown dialect roles round-trip through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    #[serde(untagged)]
    Other(String),
}

/// Reason a choice stopped generating. Unknown upstream values round-trip
/// through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Cancelled,
    Error,
    #[serde(untagged)]
    Other(String),
}

/// Token accounting reported by a backend.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,

    /// Provider-specific accounting fields pass through untouched.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// A tool definition offered to the model.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: Function,
}

/// Function declaration inside a [`Tool`].
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Option<Value>,
}

/// A structured tool call emitted by the model (or recovered from text).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    /// Build a `function`-typed call with a freshly generated id.
    pub fn function(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: crate::generate_id("call_"),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// The callable part of a [`ToolCall`]. `arguments` is a JSON-encoded string,
/// matching the OpenAI wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}
