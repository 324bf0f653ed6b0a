//! Empty-response detection and auto-retry.
//!
//! A response with neither text content nor tool calls breaks agent loops.
//! This middleware raises a retry signal carrying a recovery prompt; once the
//! per-session retry budget is spent, the failure surfaces as a backend
//! error.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{MiddlewareContext, ResponseMiddleware};
use crate::error::ProxyError;
use crate::processor::ProcessedResponse;

pub const RECOVERY_PROMPT: &str = "The previous response was empty. Please provide a valid \
    response with either text content or tool calls. Never return an empty response.";

pub struct EmptyResponseMiddleware {
    enabled: bool,
    max_retries: u32,
    retry_counts: DashMap<String, u32>,
}

impl EmptyResponseMiddleware {
    pub fn new(enabled: bool, max_retries: u32) -> Self {
        Self {
            enabled,
            max_retries,
            retry_counts: DashMap::new(),
        }
    }

    pub fn reset_session(&self, session_id: &str) {
        self.retry_counts.remove(session_id);
    }

    fn is_empty_response(response: &ProcessedResponse) -> bool {
        let content_empty = response.content.trim().is_empty();
        let has_tool_calls = response
            .metadata
            .get("tool_calls")
            .and_then(Value::as_array)
            .is_some_and(|calls| !calls.is_empty());
        content_empty && !has_tool_calls
    }
}

impl Default for EmptyResponseMiddleware {
    fn default() -> Self {
        Self::new(true, 1)
    }
}

#[async_trait]
impl ResponseMiddleware for EmptyResponseMiddleware {
    fn name(&self) -> &'static str {
        "empty_response"
    }

    // Runs last: earlier middleware may still produce content or tool calls.
    fn priority(&self) -> i32 {
        0
    }

    async fn process(
        &self,
        response: ProcessedResponse,
        session_id: &str,
        context: &MiddlewareContext,
    ) -> Result<ProcessedResponse, ProxyError> {
        if !self.enabled {
            return Ok(response);
        }

        // Mid-stream chunks are legitimately empty (usage-only frames); only
        // the terminal chunk carries the accumulated response to judge.
        if context.response_kind == super::ResponseKind::Stream
            && response.metadata.get("is_done").and_then(Value::as_bool) != Some(true)
        {
            return Ok(response);
        }

        if !Self::is_empty_response(&response) {
            self.retry_counts.remove(session_id);
            return Ok(response);
        }

        let retry_count = self
            .retry_counts
            .get(session_id)
            .map(|c| *c)
            .unwrap_or(0);

        if retry_count < self.max_retries {
            self.retry_counts
                .insert(session_id.to_string(), retry_count + 1);
            info!(
                session_id,
                attempt = retry_count + 1,
                max = self.max_retries,
                "empty response detected, requesting retry"
            );
            return Err(ProxyError::EmptyResponseRetry {
                recovery_prompt: RECOVERY_PROMPT.to_string(),
                retry_count: retry_count + 1,
            });
        }

        self.retry_counts.remove(session_id);
        warn!(session_id, "empty response persisted after retry budget");
        Err(ProxyError::Backend {
            message: "The model failed to generate a valid response after retry attempts. \
                      The response was empty (no content or tool calls)."
                .to_string(),
            backend: None,
            backend_status: None,
            backend_response: Some(json!({
                "error_type": "empty_response_max_retries_exceeded",
                "retry_count": retry_count,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopDetectionConfiguration;
    use crate::session::SessionStore;
    use std::sync::Arc;

    fn ctx() -> MiddlewareContext {
        MiddlewareContext::new(
            "s",
            Arc::new(SessionStore::new(LoopDetectionConfiguration::default())),
        )
    }

    #[tokio::test]
    async fn test_first_empty_raises_retry_then_backend_error() {
        let mw = EmptyResponseMiddleware::new(true, 1);
        let context = ctx();

        let first = mw
            .process(ProcessedResponse::text(""), "s", &context)
            .await
            .unwrap_err();
        match first {
            ProxyError::EmptyResponseRetry { retry_count, .. } => assert_eq!(retry_count, 1),
            other => panic!("expected retry signal, got {other:?}"),
        }

        let second = mw
            .process(ProcessedResponse::text(""), "s", &context)
            .await
            .unwrap_err();
        assert!(matches!(second, ProxyError::Backend { .. }));
    }

    #[tokio::test]
    async fn test_tool_calls_count_as_content() {
        let mw = EmptyResponseMiddleware::default();
        let mut response = ProcessedResponse::text("");
        response.metadata.insert(
            "tool_calls".into(),
            json!([{"id": "call_1", "type": "function",
                    "function": {"name": "f", "arguments": "{}"}}]),
        );
        assert!(mw.process(response, "s", &ctx()).await.is_ok());
    }

    #[tokio::test]
    async fn test_whitespace_only_is_empty() {
        let mw = EmptyResponseMiddleware::default();
        let err = mw
            .process(ProcessedResponse::text("  \n\t "), "s", &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::EmptyResponseRetry { .. }));
    }

    #[tokio::test]
    async fn test_non_empty_resets_counter() {
        let mw = EmptyResponseMiddleware::new(true, 1);
        let context = ctx();
        let _ = mw.process(ProcessedResponse::text(""), "s", &context).await;
        mw.process(ProcessedResponse::text("ok"), "s", &context)
            .await
            .unwrap();
        // Counter reset: the next empty response is a retry again, not a
        // budget exhaustion.
        let err = mw
            .process(ProcessedResponse::text(""), "s", &context)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::EmptyResponseRetry { .. }));
    }

    #[tokio::test]
    async fn test_disabled_passes_everything() {
        let mw = EmptyResponseMiddleware::new(false, 1);
        assert!(mw
            .process(ProcessedResponse::text(""), "s", &ctx())
            .await
            .is_ok());
    }
}
