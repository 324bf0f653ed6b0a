//! Schema-driven structured output validation.
//!
//! When the request configured a `response_schema`, the whole buffered
//! response body is repaired and validated against it, and the outcome is
//! annotated into the response metadata.

use async_trait::async_trait;
use json_repair::JsonRepairService;
use serde_json::json;
use tracing::{debug, error};

use super::{MiddlewareContext, ResponseKind, ResponseMiddleware};
use crate::error::ProxyError;
use crate::processor::ProcessedResponse;

pub struct StructuredOutputMiddleware {
    service: JsonRepairService,
    /// Strict mode re-raises validation failures; best-effort annotates and
    /// returns the original content.
    strict_validation: bool,
}

impl StructuredOutputMiddleware {
    pub fn new(strict_validation: bool) -> Self {
        Self {
            service: JsonRepairService::new(),
            strict_validation,
        }
    }
}

impl Default for StructuredOutputMiddleware {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ResponseMiddleware for StructuredOutputMiddleware {
    fn name(&self) -> &'static str {
        "structured_output"
    }

    fn priority(&self) -> i32 {
        30
    }

    async fn process(
        &self,
        mut response: ProcessedResponse,
        session_id: &str,
        context: &MiddlewareContext,
    ) -> Result<ProcessedResponse, ProxyError> {
        let Some(schema) = context.response_schema.as_ref() else {
            return Ok(response);
        };
        // Streaming chunks are validated by the stream pipeline; whole-body
        // validation only makes sense on the buffered path.
        if context.response_kind == ResponseKind::Stream {
            debug!(session_id, "skipping structured output validation for stream chunk");
            return Ok(response);
        }
        if response.content.is_empty() {
            return Ok(response);
        }

        match self
            .service
            .process_structured_response(&response.content, schema, self.strict_validation)
        {
            Ok((content, parsed)) => {
                let validated = parsed.is_some();
                response.content = content;
                response
                    .metadata
                    .insert("schema_validation_attempted".into(), json!(true));
                response
                    .metadata
                    .insert("structured_output_validated".into(), json!(validated));
                if let Some(parsed) = parsed {
                    response.metadata.insert("parsed_object".into(), parsed);
                }
                Ok(response)
            }
            Err(e) => {
                error!(session_id, error = %e, "structured output validation failed");
                if self.strict_validation {
                    return Err(ProxyError::parsing(format!(
                        "structured output validation failed: {e}"
                    )));
                }
                response
                    .metadata
                    .insert("schema_validation_attempted".into(), json!(true));
                response
                    .metadata
                    .insert("structured_output_validated".into(), json!(false));
                response
                    .metadata
                    .insert("structured_output_error".into(), json!(e.to_string()));
                Ok(response)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopDetectionConfiguration;
    use crate::session::SessionStore;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn ctx_with_schema(schema: Value) -> MiddlewareContext {
        let mut ctx = MiddlewareContext::new(
            "s",
            Arc::new(SessionStore::new(LoopDetectionConfiguration::default())),
        );
        ctx.response_schema = Some(schema);
        ctx
    }

    #[tokio::test]
    async fn test_valid_output_annotated() {
        let mw = StructuredOutputMiddleware::default();
        let ctx = ctx_with_schema(json!({
            "type": "object",
            "required": ["ok"],
            "properties": {"ok": {"type": "boolean"}}
        }));
        let out = mw
            .process(ProcessedResponse::text("{'ok': true}"), "s", &ctx)
            .await
            .unwrap();
        assert_eq!(out.metadata["structured_output_validated"], json!(true));
        assert_eq!(out.metadata["schema_validation_attempted"], json!(true));
        assert_eq!(
            serde_json::from_str::<Value>(&out.content).unwrap(),
            json!({"ok": true})
        );
    }

    #[tokio::test]
    async fn test_strict_failure_raises() {
        let mw = StructuredOutputMiddleware::new(true);
        let ctx = ctx_with_schema(json!({"type": "object", "required": ["missing"]}));
        assert!(mw
            .process(ProcessedResponse::text("{\"a\": 1}"), "s", &ctx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_best_effort_failure_annotates() {
        let mw = StructuredOutputMiddleware::new(false);
        let ctx = ctx_with_schema(json!({"type": "object", "required": ["missing"]}));
        let out = mw
            .process(ProcessedResponse::text("{\"a\": 1}"), "s", &ctx)
            .await
            .unwrap();
        assert_eq!(out.metadata["structured_output_validated"], json!(false));
        assert_eq!(out.content, "{\"a\": 1}");
    }

    #[tokio::test]
    async fn test_no_schema_is_passthrough() {
        let mw = StructuredOutputMiddleware::default();
        let ctx = MiddlewareContext::new(
            "s",
            Arc::new(SessionStore::new(LoopDetectionConfiguration::default())),
        );
        let out = mw
            .process(ProcessedResponse::text("anything"), "s", &ctx)
            .await
            .unwrap();
        assert_eq!(out.content, "anything");
        assert!(out.metadata.get("schema_validation_attempted").is_none());
    }
}
