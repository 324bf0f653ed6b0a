//! Stream stage that runs the response middleware chain over each chunk.

use std::sync::Arc;

use async_trait::async_trait;
use chat_protocol::ToolCall;
use serde_json::Value;

use super::{StreamChunk, StreamProcessor};
use crate::error::ProxyError;
use crate::middleware::{MiddlewareApplicationManager, MiddlewareContext, ResponseKind};
use crate::processor::ProcessedResponse;
use crate::session::SessionStore;

pub struct MiddlewareApplicationProcessor {
    manager: Arc<MiddlewareApplicationManager>,
    sessions: Arc<SessionStore>,
}

impl MiddlewareApplicationProcessor {
    pub fn new(manager: Arc<MiddlewareApplicationManager>, sessions: Arc<SessionStore>) -> Self {
        Self { manager, sessions }
    }

    fn context_for(&self, chunk: &StreamChunk) -> MiddlewareContext {
        let session_id = chunk
            .metadata
            .session_id
            .clone()
            .or_else(|| chunk.metadata.id.clone())
            .unwrap_or_default();

        let mut context = MiddlewareContext::new(session_id, self.sessions.clone());
        context.response_kind = if chunk.metadata.non_streaming {
            ResponseKind::NonStreaming
        } else {
            ResponseKind::Stream
        };
        context.expected_json = chunk.metadata.expected_json;
        context.content_type = chunk.metadata.content_type.clone();
        context.response_schema = chunk
            .metadata
            .extra
            .get("response_schema")
            .filter(|s| !s.is_null())
            .cloned();
        context
    }
}

#[async_trait]
impl StreamProcessor for MiddlewareApplicationProcessor {
    fn name(&self) -> &'static str {
        "middleware_application"
    }

    async fn process(&self, mut chunk: StreamChunk) -> Result<StreamChunk, ProxyError> {
        let context = self.context_for(&chunk);

        let mut response = ProcessedResponse {
            content: std::mem::take(&mut chunk.content),
            usage: chunk.usage.clone(),
            metadata: chunk.metadata.extra.clone(),
        };
        response
            .metadata
            .insert("is_done".into(), Value::Bool(chunk.is_done));
        if !chunk.metadata.tool_calls.is_empty() {
            response.metadata.insert(
                "tool_calls".into(),
                serde_json::to_value(&chunk.metadata.tool_calls).unwrap_or(Value::Null),
            );
        }

        let processed = self.manager.apply(response, &context).await?;

        chunk.content = processed.content;
        chunk.usage = processed.usage;
        if let Some(calls) = processed.metadata.get("tool_calls") {
            if let Ok(parsed) = serde_json::from_value::<Vec<ToolCall>>(calls.clone()) {
                chunk.metadata.tool_calls = parsed;
            }
        }
        chunk.metadata.extra = processed.metadata;
        Ok(chunk)
    }
}
