//! Stream stage that watches for repetition loops and cancels the stream.

use async_trait::async_trait;
use dashmap::DashMap;
use loop_detection::{HybridConfig, HybridLoopDetector, LoopDetectionEvent};
use metrics::counter;
use serde_json::json;
use tracing::warn;

use super::{StreamChunk, StreamProcessor};
use crate::error::ProxyError;

/// Runs a per-stream [`HybridLoopDetector`] over the content. On detection
/// the stream is replaced by a single terminal cancellation chunk carrying a
/// structured message.
pub struct LoopDetectionProcessor {
    config: HybridConfig,
    detectors: DashMap<String, HybridLoopDetector>,
}

impl LoopDetectionProcessor {
    pub fn new(config: HybridConfig) -> Self {
        Self {
            config,
            detectors: DashMap::new(),
        }
    }

    fn cancellation_chunk(original: &StreamChunk, event: &LoopDetectionEvent) -> StreamChunk {
        let message = format!(
            "[Response cancelled: Loop detected - Pattern '{}' repeated {} times]",
            event.pattern_excerpt(),
            event.repetition_count
        );
        let mut chunk = StreamChunk::cancellation(message);
        chunk.metadata.id = original.metadata.id.clone();
        chunk.metadata.model = original.metadata.model.clone();
        chunk.metadata.created = original.metadata.created;
        chunk.metadata.session_id = original.metadata.session_id.clone();
        chunk.metadata.stream_id = original.metadata.stream_id.clone();
        chunk.metadata.loop_detected = true;
        chunk
            .metadata
            .extra
            .insert("loop_pattern".into(), json!(event.pattern));
        chunk
            .metadata
            .extra
            .insert("loop_repetitions".into(), json!(event.repetition_count));
        chunk
    }
}

impl Default for LoopDetectionProcessor {
    fn default() -> Self {
        Self::new(HybridConfig::default())
    }
}

#[async_trait]
impl StreamProcessor for LoopDetectionProcessor {
    fn name(&self) -> &'static str {
        "loop_detection"
    }

    async fn process(&self, chunk: StreamChunk) -> Result<StreamChunk, ProxyError> {
        let stream_id = match chunk.metadata.stream_id.clone() {
            Some(id) => id,
            None => return Ok(chunk),
        };

        if chunk
            .metadata
            .extra
            .get("loop_detection_enabled")
            .and_then(serde_json::Value::as_bool)
            == Some(false)
        {
            return Ok(chunk);
        }

        if chunk.content.is_empty() && !chunk.is_done {
            return Ok(chunk);
        }

        let event = {
            let mut detector = self
                .detectors
                .entry(stream_id.clone())
                .or_insert_with(|| HybridLoopDetector::new(self.config));
            detector.process_chunk(&chunk.content)
        };

        if chunk.is_done {
            self.detectors.remove(&stream_id);
        }

        match event {
            Some(event) => {
                counter!("lpg_loop_detected_stream").increment(1);
                warn!(
                    stream_id,
                    repetitions = event.repetition_count,
                    "loop detected in streaming response, cancelling"
                );
                self.detectors.remove(&stream_id);
                Ok(Self::cancellation_chunk(&chunk, &event))
            }
            None => Ok(chunk),
        }
    }

    fn reset(&self) {
        self.detectors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(stream_id: &str, content: &str) -> StreamChunk {
        let mut c = StreamChunk::text(content);
        c.metadata.stream_id = Some(stream_id.to_string());
        c
    }

    #[tokio::test]
    async fn test_loop_produces_cancellation_chunk() {
        let p = LoopDetectionProcessor::default();
        let unit = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN";
        let mut cancelled = None;
        for _ in 0..12 {
            let out = p.process(chunk("s", unit)).await.unwrap();
            if out.is_cancellation {
                cancelled = Some(out);
                break;
            }
        }
        let out = cancelled.expect("loop should cancel the stream");
        assert!(out.is_done);
        assert!(out.metadata.loop_detected);
        assert!(out.content.contains("Loop detected"));
    }

    #[tokio::test]
    async fn test_streams_do_not_share_detectors() {
        let p = LoopDetectionProcessor::default();
        let unit = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN";
        for _ in 0..6 {
            let out = p.process(chunk("a", unit)).await.unwrap();
            assert!(!out.is_cancellation);
        }
        // Stream "b" starts clean even though "a" is half way to a loop.
        for _ in 0..6 {
            let out = p.process(chunk("b", unit)).await.unwrap();
            assert!(!out.is_cancellation);
        }
    }

    #[tokio::test]
    async fn test_session_disable_flag() {
        let p = LoopDetectionProcessor::default();
        let unit = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN";
        for _ in 0..15 {
            let mut c = chunk("s", unit);
            c.metadata
                .extra
                .insert("loop_detection_enabled".into(), serde_json::json!(false));
            let out = p.process(c).await.unwrap();
            assert!(!out.is_cancellation);
        }
    }
}
