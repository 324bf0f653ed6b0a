//! Pass-through observability middleware.

use async_trait::async_trait;
use tracing::debug;

use super::{MiddlewareContext, ResponseMiddleware};
use crate::error::ProxyError;
use crate::processor::ProcessedResponse;

pub struct LoggingMiddleware;

#[async_trait]
impl ResponseMiddleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn process(
        &self,
        response: ProcessedResponse,
        session_id: &str,
        _context: &MiddlewareContext,
    ) -> Result<ProcessedResponse, ProxyError> {
        debug!(
            session_id,
            content_bytes = response.content.len(),
            has_usage = response.usage.is_some(),
            "response entering middleware chain"
        );
        Ok(response)
    }
}
