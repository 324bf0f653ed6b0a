//! Buffered-response counterpart of the streaming JSON repair stage, with
//! the same strict-mode gating.

use async_trait::async_trait;
use json_repair::JsonRepairService;
use metrics::counter;
use tracing::warn;

use super::{MiddlewareContext, ResponseMiddleware};
use crate::error::ProxyError;
use crate::processor::ProcessedResponse;

pub struct JsonRepairMiddleware {
    service: JsonRepairService,
}

impl JsonRepairMiddleware {
    pub fn new() -> Self {
        Self {
            service: JsonRepairService::new(),
        }
    }
}

impl Default for JsonRepairMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseMiddleware for JsonRepairMiddleware {
    fn name(&self) -> &'static str {
        "json_repair"
    }

    fn priority(&self) -> i32 {
        40
    }

    async fn process(
        &self,
        mut response: ProcessedResponse,
        session_id: &str,
        context: &MiddlewareContext,
    ) -> Result<ProcessedResponse, ProxyError> {
        // Ungated responses pass through byte-identical.
        if !context.json_gate_engaged() {
            return Ok(response);
        }

        let trimmed = response.content.trim();
        if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
            return Ok(response);
        }

        let strict = context.response_schema.is_some();
        match self.service.repair_and_validate(
            trimmed,
            context.response_schema.as_ref(),
            strict,
        ) {
            Ok(Some(value)) => {
                counter!("lpg_json_repair_buffered_success").increment(1);
                response.content = value.to_string();
                Ok(response)
            }
            Ok(None) => {
                counter!("lpg_json_repair_buffered_fallback").increment(1);
                warn!(session_id, "buffered JSON repair failed, keeping raw content");
                Ok(response)
            }
            Err(e) => {
                counter!("lpg_json_repair_buffered_strict_fail").increment(1);
                Err(ProxyError::parsing(format!(
                    "strict JSON validation failed: {e}"
                )))
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

    fn ctx() -> MiddlewareContext {
        MiddlewareContext::new(
            "s",
            Arc::new(SessionStore::new(LoopDetectionConfiguration::default())),
        )
    }

    #[tokio::test]
    async fn test_identity_when_gate_off() {
        let mw = JsonRepairMiddleware::new();
        let raw = "{'looks': 'like json but gate is off',}";
        let out = mw
            .process(ProcessedResponse::text(raw), "s", &ctx())
            .await
            .unwrap();
        assert_eq!(out.content, raw);
    }

    #[tokio::test]
    async fn test_repairs_when_expected_json() {
        let mw = JsonRepairMiddleware::new();
        let mut context = ctx();
        context.expected_json = Some(true);
        let out = mw
            .process(ProcessedResponse::text("{'a': 1,}"), "s", &context)
            .await
            .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&out.content).unwrap(),
            json!({"a": 1})
        );
    }

    #[tokio::test]
    async fn test_json_content_type_engages_gate() {
        let mw = JsonRepairMiddleware::new();
        let mut context = ctx();
        context.content_type = Some("application/json; charset=utf-8".into());
        let out = mw
            .process(ProcessedResponse::text("{'b': true}"), "s", &context)
            .await
            .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&out.content).unwrap(),
            json!({"b": true})
        );
    }

    #[tokio::test]
    async fn test_schema_failure_raises() {
        let mw = JsonRepairMiddleware::new();
        let mut context = ctx();
        context.response_schema = Some(json!({"type": "object", "required": ["zz"]}));
        let err = mw
            .process(ProcessedResponse::text("{\"a\": 1}"), "s", &context)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Parsing { .. }));
    }
}
