//! Strips known boilerplate preambles from response content.

use async_trait::async_trait;

use super::{MiddlewareContext, ResponseMiddleware};
use crate::error::ProxyError;
use crate::processor::ProcessedResponse;

pub struct ContentFilterMiddleware {
    preambles: Vec<String>,
}

impl ContentFilterMiddleware {
    pub fn new(preambles: Vec<String>) -> Self {
        Self { preambles }
    }
}

impl Default for ContentFilterMiddleware {
    fn default() -> Self {
        Self::new(vec!["As an AI language model, ".to_string()])
    }
}

#[async_trait]
impl ResponseMiddleware for ContentFilterMiddleware {
    fn name(&self) -> &'static str {
        "content_filter"
    }

    fn priority(&self) -> i32 {
        50
    }

    async fn process(
        &self,
        mut response: ProcessedResponse,
        _session_id: &str,
        _context: &MiddlewareContext,
    ) -> Result<ProcessedResponse, ProxyError> {
        for preamble in &self.preambles {
            if let Some(rest) = response.content.strip_prefix(preamble.as_str()) {
                response.content = rest.to_string();
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
    use std::sync::Arc;

    #[tokio::test]
    async fn test_strips_preamble() {
        let mw = ContentFilterMiddleware::default();
        let ctx = MiddlewareContext::new(
            "s",
            Arc::new(SessionStore::new(LoopDetectionConfiguration::default())),
        );
        let out = mw
            .process(
                ProcessedResponse::text("As an AI language model, I can help."),
                "s",
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.content, "I can help.");
    }
}
