//! Response processing entry points: the buffered and streaming paths.

mod request;
mod response;

pub use request::{RequestOutcome, RequestProcessor};
pub use response::{ResponseHints, ResponseProcessor};

use chat_protocol::ToolCall;
use serde_json::{Map, Value};

/// The pipeline's output unit: processed content plus accounting and
/// annotations accumulated by the middleware chain.
#[derive(Debug, Clone, Default)]
pub struct ProcessedResponse {
    pub content: String,
    pub usage: Option<Value>,
    pub metadata: Map<String, Value>,
}

impl ProcessedResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Structured tool calls recorded in the metadata, if any.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.metadata
            .get("tool_calls")
            .and_then(|calls| serde_json::from_value(calls.clone()).ok())
            .unwrap_or_default()
    }
}
