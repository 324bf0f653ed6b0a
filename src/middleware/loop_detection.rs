//! Buffered-path loop detection fallback.
//!
//! Backends that cannot stream never pass through the streaming loop
//! detector, so this middleware accumulates per-session text and runs the
//! hybrid detector once enough content has built up.

use async_trait::async_trait;
use dashmap::DashMap;
use loop_detection::HybridLoopDetector;
use tracing::warn;

use super::{MiddlewareContext, ResponseKind, ResponseMiddleware};
use crate::error::ProxyError;
use crate::processor::ProcessedResponse;

const MIN_ACCUMULATION: usize = 100;
const MAX_ACCUMULATION: usize = 4000;

pub struct LoopDetectionMiddleware {
    accumulated: DashMap<String, String>,
}

impl LoopDetectionMiddleware {
    pub fn new() -> Self {
        Self {
            accumulated: DashMap::new(),
        }
    }

    pub fn reset_session(&self, session_id: &str) {
        self.accumulated.remove(session_id);
    }
}

impl Default for LoopDetectionMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseMiddleware for LoopDetectionMiddleware {
    fn name(&self) -> &'static str {
        "loop_detection"
    }

    fn priority(&self) -> i32 {
        20
    }

    async fn process(
        &self,
        response: ProcessedResponse,
        session_id: &str,
        context: &MiddlewareContext,
    ) -> Result<ProcessedResponse, ProxyError> {
        // The streaming pipeline has its own detector stage.
        if context.response_kind == ResponseKind::Stream {
            return Ok(response);
        }
        if !context.config.loop_detection_enabled || response.content.is_empty() {
            return Ok(response);
        }

        let accumulated = {
            let mut entry = self.accumulated.entry(session_id.to_string()).or_default();
            entry.push_str(&response.content);
            if entry.len() > MAX_ACCUMULATION {
                let cut = entry.len() - MAX_ACCUMULATION;
                let boundary = (cut..entry.len())
                    .find(|i| entry.is_char_boundary(*i))
                    .unwrap_or(entry.len());
                entry.drain(..boundary);
            }
            entry.clone()
        };

        if accumulated.len() < MIN_ACCUMULATION {
            return Ok(response);
        }

        let result = HybridLoopDetector::default().check_for_loops(&accumulated);
        if result.has_loop {
            self.accumulated.remove(session_id);
            let pattern = result.pattern.unwrap_or_default();
            let repetitions = result.repetitions.unwrap_or(0);
            warn!(
                session_id,
                repetitions, "loop detected in buffered response"
            );
            return Err(ProxyError::LoopDetected {
                pattern,
                repetitions,
            });
        }

        Ok(response)
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
    async fn test_loop_in_buffered_response_raises() {
        let mw = LoopDetectionMiddleware::new();
        let looping = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN".repeat(12);
        let err = mw
            .process(ProcessedResponse::text(looping), "s", &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::LoopDetected { .. }));
    }

    #[tokio::test]
    async fn test_short_content_not_checked() {
        let mw = LoopDetectionMiddleware::new();
        let out = mw
            .process(ProcessedResponse::text("short"), "s", &ctx())
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn test_streaming_kind_skipped() {
        let mw = LoopDetectionMiddleware::new();
        let mut context = ctx();
        context.response_kind = ResponseKind::Stream;
        let looping = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN".repeat(12);
        assert!(mw
            .process(ProcessedResponse::text(looping), "s", &context)
            .await
            .is_ok());
    }
}
