//! Feeds structured tool calls into the session's loop tracker and blocks
//! when a repetition threshold is crossed.

use async_trait::async_trait;
use chat_protocol::ToolCall;
use serde_json::Value;
use tracing::warn;

use super::{MiddlewareContext, ResponseMiddleware};
use crate::error::ProxyError;
use crate::processor::ProcessedResponse;

pub struct ToolCallLoopDetectionMiddleware;

impl ToolCallLoopDetectionMiddleware {
    /// Structured tool calls from the response: the typed metadata entry
    /// first, falling back to parsing content that is itself a chat
    /// completion JSON body.
    fn extract_tool_calls(response: &ProcessedResponse) -> Vec<ToolCall> {
        if let Some(calls) = response.metadata.get("tool_calls") {
            if let Ok(parsed) = serde_json::from_value::<Vec<ToolCall>>(calls.clone()) {
                if !parsed.is_empty() {
                    return parsed;
                }
            }
        }

        let Ok(data) = serde_json::from_str::<Value>(&response.content) else {
            return Vec::new();
        };

        if let Some(calls) = data
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("tool_calls"))
        {
            if let Ok(parsed) = serde_json::from_value::<Vec<ToolCall>>(calls.clone()) {
                return parsed;
            }
        }

        if data.is_array() {
            if let Ok(parsed) = serde_json::from_value::<Vec<ToolCall>>(data) {
                return parsed;
            }
        }

        Vec::new()
    }
}

#[async_trait]
impl ResponseMiddleware for ToolCallLoopDetectionMiddleware {
    fn name(&self) -> &'static str {
        "tool_call_loop_detection"
    }

    fn priority(&self) -> i32 {
        15
    }

    async fn process(
        &self,
        response: ProcessedResponse,
        session_id: &str,
        context: &MiddlewareContext,
    ) -> Result<ProcessedResponse, ProxyError> {
        if !context.config.tool_loop_detection_enabled {
            return Ok(response);
        }

        let calls = Self::extract_tool_calls(&response);
        if calls.is_empty() {
            return Ok(response);
        }

        for call in &calls {
            let verdict = context.sessions.track_tool_call(
                session_id,
                &call.function.name,
                &call.function.arguments,
                false,
            );
            if let Some(verdict) = verdict {
                warn!(
                    session_id,
                    tool = %call.function.name,
                    repeats = verdict.repeat_count,
                    "tool call loop detected"
                );
                return Err(ProxyError::ToolCallLoopDetected {
                    reason: verdict.reason,
                    tool_name: call.function.name.clone(),
                    repetitions: verdict.repeat_count as usize,
                });
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopDetectionConfiguration;
    use crate::session::SessionStore;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> MiddlewareContext {
        MiddlewareContext::new(
            "s",
            Arc::new(SessionStore::new(LoopDetectionConfiguration::default())),
        )
    }

    fn response_with_call(name: &str, args: &str) -> ProcessedResponse {
        let mut response = ProcessedResponse::text("");
        response.metadata.insert(
            "tool_calls".into(),
            json!([{
                "id": "call_1",
                "type": "function",
                "function": {"name": name, "arguments": args}
            }]),
        );
        response
    }

    #[tokio::test]
    async fn test_four_identical_calls_block() {
        let mw = ToolCallLoopDetectionMiddleware;
        let context = ctx();
        for _ in 0..3 {
            assert!(mw
                .process(response_with_call("hello", r#"{"x":1}"#), "s", &context)
                .await
                .is_ok());
        }
        let err = mw
            .process(response_with_call("hello", r#"{"x":1}"#), "s", &context)
            .await
            .unwrap_err();
        match err {
            ProxyError::ToolCallLoopDetected { repetitions, .. } => assert_eq!(repetitions, 4),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_calls_extracted_from_content_json() {
        let mw = ToolCallLoopDetectionMiddleware;
        let context = ctx();
        let body = json!({
            "choices": [{"message": {"tool_calls": [{
                "id": "call_2",
                "type": "function",
                "function": {"name": "f", "arguments": "{}"}
            }]}}]
        })
        .to_string();
        // Tracked without error (first occurrence).
        assert!(mw
            .process(ProcessedResponse::text(body), "s", &context)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_disabled_by_config() {
        let mw = ToolCallLoopDetectionMiddleware;
        let mut context = ctx();
        context.config = context.config.with_tool_loop_detection_enabled(false);
        for _ in 0..10 {
            assert!(mw
                .process(response_with_call("f", "{}"), "s", &context)
                .await
                .is_ok());
        }
    }
}
