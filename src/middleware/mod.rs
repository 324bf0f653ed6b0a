//! Response middleware: ordered, priority-sorted processors applied to both
//! buffered responses and (per chunk) streaming responses.

mod content_filter;
mod edit_precision;
mod empty_response;
mod json_repair;
mod logging;
mod loop_detection;
mod structured_output;
mod tool_call_loop;

pub use content_filter::ContentFilterMiddleware;
pub use edit_precision::EditPrecisionResponseMiddleware;
pub use empty_response::EmptyResponseMiddleware;
pub use json_repair::JsonRepairMiddleware;
pub use logging::LoggingMiddleware;
pub use loop_detection::LoopDetectionMiddleware;
pub use structured_output::StructuredOutputMiddleware;
pub use tool_call_loop::ToolCallLoopDetectionMiddleware;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::LoopDetectionConfiguration;
use crate::error::ProxyError;
use crate::processor::ProcessedResponse;
use crate::session::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Stream,
    NonStreaming,
}

/// Everything a middleware may consult while processing one response.
#[derive(Clone)]
pub struct MiddlewareContext {
    pub session_id: String,
    pub response_kind: ResponseKind,
    pub expected_json: Option<bool>,
    pub content_type: Option<String>,
    /// Schema explicitly configured for this request.
    pub response_schema: Option<Value>,
    pub config: LoopDetectionConfiguration,
    pub sessions: Arc<SessionStore>,
}

impl MiddlewareContext {
    pub fn new(session_id: impl Into<String>, sessions: Arc<SessionStore>) -> Self {
        let session_id = session_id.into();
        let config = sessions.loop_config(&session_id);
        Self {
            session_id,
            response_kind: ResponseKind::NonStreaming,
            expected_json: None,
            content_type: None,
            response_schema: None,
            config,
            sessions,
        }
    }

    /// Strict-mode gate for JSON handling, ORing the three signals.
    pub fn json_gate_engaged(&self) -> bool {
        self.expected_json == Some(true)
            || self
                .content_type
                .as_deref()
                .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"))
            || self.response_schema.is_some()
    }
}

/// One element of the response middleware chain.
///
/// Returning a replacement response always wins, even when its content is
/// falsy (`""`, `{}`, `[]`, `0`, `false`); the manager never coalesces back
/// to the input. Raising short-circuits the chain.
#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher priorities run first; ties keep insertion order.
    fn priority(&self) -> i32 {
        0
    }

    async fn process(
        &self,
        response: ProcessedResponse,
        session_id: &str,
        context: &MiddlewareContext,
    ) -> Result<ProcessedResponse, ProxyError>;
}

/// Applies the configured middleware in priority order.
pub struct MiddlewareApplicationManager {
    middleware: Vec<Arc<dyn ResponseMiddleware>>,
}

impl MiddlewareApplicationManager {
    pub fn new(mut middleware: Vec<Arc<dyn ResponseMiddleware>>) -> Self {
        // Stable sort: equal priorities keep their registration order.
        middleware.sort_by_key(|mw| std::cmp::Reverse(mw.priority()));
        Self { middleware }
    }

    pub fn middleware_names(&self) -> Vec<&'static str> {
        self.middleware.iter().map(|mw| mw.name()).collect()
    }

    pub async fn apply(
        &self,
        mut response: ProcessedResponse,
        context: &MiddlewareContext,
    ) -> Result<ProcessedResponse, ProxyError> {
        for mw in &self.middleware {
            response = mw.process(response, &context.session_id, context).await?;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopDetectionConfiguration;

    struct Tagger {
        tag: &'static str,
        priority: i32,
    }

    #[async_trait]
    impl ResponseMiddleware for Tagger {
        fn name(&self) -> &'static str {
            self.tag
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn process(
            &self,
            mut response: ProcessedResponse,
            _session_id: &str,
            _context: &MiddlewareContext,
        ) -> Result<ProcessedResponse, ProxyError> {
            response.content.push_str(self.tag);
            Ok(response)
        }
    }

    fn context() -> MiddlewareContext {
        MiddlewareContext::new(
            "test-session",
            Arc::new(SessionStore::new(LoopDetectionConfiguration::default())),
        )
    }

    #[tokio::test]
    async fn test_priority_order_and_stability() {
        let manager = MiddlewareApplicationManager::new(vec![
            Arc::new(Tagger { tag: "a", priority: 0 }),
            Arc::new(Tagger { tag: "b", priority: 10 }),
            Arc::new(Tagger { tag: "c", priority: 0 }),
        ]);
        let out = manager
            .apply(ProcessedResponse::text(""), &context())
            .await
            .unwrap();
        assert_eq!(out.content, "bac");
    }

    struct Replacer;

    #[async_trait]
    impl ResponseMiddleware for Replacer {
        fn name(&self) -> &'static str {
            "replacer"
        }

        async fn process(
            &self,
            _response: ProcessedResponse,
            _session_id: &str,
            _context: &MiddlewareContext,
        ) -> Result<ProcessedResponse, ProxyError> {
            Ok(ProcessedResponse::text("{}"))
        }
    }

    #[tokio::test]
    async fn test_falsy_replacement_preserved() {
        let manager = MiddlewareApplicationManager::new(vec![Arc::new(Replacer)]);
        let out = manager
            .apply(ProcessedResponse::text("original text"), &context())
            .await
            .unwrap();
        assert_eq!(out.content, "{}");
    }

    #[tokio::test]
    async fn test_empty_replacement_preserved() {
        struct Empty;

        #[async_trait]
        impl ResponseMiddleware for Empty {
            fn name(&self) -> &'static str {
                "empty"
            }

            async fn process(
                &self,
                _response: ProcessedResponse,
                _session_id: &str,
                _context: &MiddlewareContext,
            ) -> Result<ProcessedResponse, ProxyError> {
                Ok(ProcessedResponse::text(""))
            }
        }

        let manager = MiddlewareApplicationManager::new(vec![Arc::new(Empty)]);
        let out = manager
            .apply(ProcessedResponse::text("ignored"), &context())
            .await
            .unwrap();
        assert_eq!(out.content, "");
    }
}
