//! The streaming pipeline: chunk normalization and the ordered processor
//! chain.

mod chunk;
mod content_accumulation;
mod json_repair;
mod loop_detection;
mod middleware_application;
mod normalizer;
mod tool_call_repair;

pub use chunk::{ChunkMetadata, RawChunk, StreamChunk};
pub use content_accumulation::ContentAccumulationProcessor;
pub use json_repair::JsonRepairProcessor;
pub use loop_detection::LoopDetectionProcessor;
pub use middleware_application::MiddlewareApplicationProcessor;
pub use normalizer::{StreamContext, StreamNormalizer};
pub use tool_call_repair::ToolCallRepairProcessor;

use async_trait::async_trait;

use crate::error::ProxyError;

/// One stage of the per-stream processing chain.
///
/// Processors are shared across concurrent streams; any per-stream state MUST
/// be keyed on `metadata.stream_id`, never on a shared singleton.
#[async_trait]
pub trait StreamProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, chunk: StreamChunk) -> Result<StreamChunk, ProxyError>;

    /// Drop all per-stream state. Called between logical streams.
    fn reset(&self) {}
}
