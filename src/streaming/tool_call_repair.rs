//! Stream stage that rewrites textual tool calls into structured form.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use tool_repair::StreamingToolCallScanner;

use super::{StreamChunk, StreamProcessor};
use crate::error::ProxyError;

/// Applies [`StreamingToolCallScanner`] per stream. Recovered calls are moved
/// into `metadata.tool_calls`; surrounding text flows through in order.
pub struct ToolCallRepairProcessor {
    scanners: DashMap<String, StreamingToolCallScanner>,
    max_buffer_bytes: usize,
}

impl ToolCallRepairProcessor {
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            scanners: DashMap::new(),
            max_buffer_bytes,
        }
    }
}

impl Default for ToolCallRepairProcessor {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

#[async_trait]
impl StreamProcessor for ToolCallRepairProcessor {
    fn name(&self) -> &'static str {
        "tool_call_repair"
    }

    async fn process(&self, mut chunk: StreamChunk) -> Result<StreamChunk, ProxyError> {
        let stream_id = match chunk.metadata.stream_id.clone() {
            Some(id) => id,
            None => return Ok(chunk),
        };

        if chunk.content.is_empty() && !chunk.is_done {
            return Ok(chunk);
        }

        let mut scanner = self
            .scanners
            .entry(stream_id.clone())
            .or_insert_with(|| StreamingToolCallScanner::new(self.max_buffer_bytes));

        let mut outcome = scanner.feed(&chunk.content);
        if chunk.is_done {
            let tail = scanner.finish();
            outcome.text.push_str(&tail.text);
            outcome.calls.extend(tail.calls);
        }
        drop(scanner);

        if chunk.is_done {
            self.scanners.remove(&stream_id);
        }

        if !outcome.calls.is_empty() {
            debug!(
                stream_id,
                calls = outcome.calls.len(),
                "tool calls repaired in stream"
            );
        }
        chunk.content = outcome.text;
        chunk.metadata.tool_calls.extend(outcome.calls);
        Ok(chunk)
    }

    fn reset(&self) {
        self.scanners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(stream_id: &str, content: &str, done: bool) -> StreamChunk {
        let mut c = StreamChunk::text(content);
        c.metadata.stream_id = Some(stream_id.to_string());
        c.is_done = done;
        c
    }

    #[tokio::test]
    async fn test_textual_call_rewritten_to_metadata() {
        let p = ToolCallRepairProcessor::default();
        let out = p
            .process(chunk("s", r#"TOOL CALL: f {"x": 1} tail"#, true))
            .await
            .unwrap();
        assert_eq!(out.metadata.tool_calls.len(), 1);
        assert_eq!(out.metadata.tool_calls[0].function.name, "f");
        assert!(out.content.contains("tail"));
    }

    #[tokio::test]
    async fn test_parallel_streams_do_not_mix() {
        let p = ToolCallRepairProcessor::default();
        p.process(chunk("a", "TOOL CALL: alpha {\"v\"", false))
            .await
            .unwrap();
        p.process(chunk("b", "TOOL CALL: beta {\"v\"", false))
            .await
            .unwrap();

        let out_a = p.process(chunk("a", ": 1}", false)).await.unwrap();
        let out_b = p.process(chunk("b", ": 2}", false)).await.unwrap();
        assert_eq!(out_a.metadata.tool_calls[0].function.name, "alpha");
        assert_eq!(out_b.metadata.tool_calls[0].function.name, "beta");
    }

    #[tokio::test]
    async fn test_state_dropped_on_done() {
        let p = ToolCallRepairProcessor::default();
        p.process(chunk("s", "plain text", false)).await.unwrap();
        p.process(chunk("s", "", true)).await.unwrap();
        assert!(p.scanners.is_empty());
    }
}
