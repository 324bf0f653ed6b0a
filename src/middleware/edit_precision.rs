//! Detects edit failures in model responses and flags next-call tuning.
//!
//! A response containing a known edit-failure marker (diff errors, SEARCH
//! block mismatches) marks the session so the next outbound request can apply
//! edit-precision overrides.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::RegexSet;
use tracing::info;

use super::{MiddlewareContext, ResponseMiddleware};
use crate::error::ProxyError;
use crate::processor::ProcessedResponse;

static RESPONSE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?is)<diff_error>|diff_error",
        r"(?is)SEARCH\s+block.*does\s+not\s+match",
        r"(?is)No\s+sufficiently\s+similar\s+match\s+found",
        r"(?is)hunk\s+failed\s+to\s+apply",
    ])
    .unwrap()
});

pub struct EditPrecisionResponseMiddleware;

#[async_trait]
impl ResponseMiddleware for EditPrecisionResponseMiddleware {
    fn name(&self) -> &'static str {
        "edit_precision"
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn process(
        &self,
        response: ProcessedResponse,
        session_id: &str,
        context: &MiddlewareContext,
    ) -> Result<ProcessedResponse, ProxyError> {
        if response.content.is_empty() || session_id.is_empty() {
            return Ok(response);
        }

        if RESPONSE_PATTERNS.is_match(&response.content) {
            let pending = context.sessions.note_edit_failure(session_id);
            info!(
                session_id,
                pending, "edit-precision trigger detected in response"
            );
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

    #[tokio::test]
    async fn test_marker_increments_pending() {
        let sessions = Arc::new(SessionStore::new(LoopDetectionConfiguration::default()));
        let ctx = MiddlewareContext::new("s", sessions.clone());
        let mw = EditPrecisionResponseMiddleware;

        mw.process(
            ProcessedResponse::text("UnifiedDiffNoMatch: hunk failed to apply"),
            "s",
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(sessions.take_edit_precision_pending("s"), 1);
    }

    #[tokio::test]
    async fn test_clean_response_leaves_counter() {
        let sessions = Arc::new(SessionStore::new(LoopDetectionConfiguration::default()));
        let ctx = MiddlewareContext::new("s", sessions.clone());
        let mw = EditPrecisionResponseMiddleware;

        mw.process(ProcessedResponse::text("all edits applied"), "s", &ctx)
            .await
            .unwrap();
        assert_eq!(sessions.take_edit_precision_pending("s"), 0);
    }
}
