//! The stream normalizer: converts heterogeneous upstream chunks into
//! [`StreamChunk`]s and drives the ordered processor chain.
//!
//! Each stream runs as a producer task draining the upstream source into a
//! bounded channel (back-pressure comes from the channel's capacity). A
//! caller that drops the receiver cancels the producer on its next send; the
//! upstream source is closed by dropping it.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{RawChunk, StreamChunk, StreamProcessor};
use crate::error::ProxyError;

/// Per-stream channel capacity (chunks in flight).
const CHANNEL_CAPACITY: usize = 16;

/// Request-scoped hints stamped onto every chunk of a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    pub session_id: Option<String>,
    pub expected_json: Option<bool>,
    pub content_type: Option<String>,
    pub response_schema: Option<Value>,
    pub loop_detection_enabled: Option<bool>,
}

/// Applies a series of stream processors to a normalized stream.
pub struct StreamNormalizer {
    processors: Vec<Arc<dyn StreamProcessor>>,
}

impl StreamNormalizer {
    pub fn new(processors: Vec<Arc<dyn StreamProcessor>>) -> Self {
        Self { processors }
    }

    /// Reset any stateful processors prior to processing a new stream.
    pub fn reset(&self) {
        for processor in &self.processors {
            processor.reset();
        }
    }

    /// Process a raw upstream stream into normalized chunks.
    pub fn process_stream(
        &self,
        source: BoxStream<'static, RawChunk>,
        context: StreamContext,
    ) -> ReceiverStream<StreamChunk> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let processors = self.processors.clone();

        tokio::spawn(async move {
            let stream_id = Uuid::new_v4().simple().to_string();
            let mut source = source;
            let mut emitted_done = false;

            while let Some(raw) = source.next().await {
                let mut chunk = StreamChunk::from_raw(raw);
                stamp(&mut chunk, &context, &stream_id);

                if !chunk.has_payload() && !chunk.is_done {
                    continue;
                }

                match run_chain(&processors, chunk).await {
                    ChainOutcome::Emit(chunk) => {
                        let done = chunk.is_done;
                        if tx.send(chunk).await.is_err() {
                            debug!(stream_id, "consumer dropped, closing stream");
                            return;
                        }
                        if done {
                            emitted_done = true;
                            // Stop iterating; dropping the source closes the
                            // upstream connection, discarding its later bytes.
                            break;
                        }
                    }
                    ChainOutcome::Skip => {}
                    ChainOutcome::Fail(error) => {
                        let _ = tx.send(failure_chunk(error, &context, &stream_id)).await;
                        return;
                    }
                }
            }

            if !emitted_done {
                // Upstream ended without a terminal marker: synthesize one so
                // accumulating processors flush and the invariant of exactly
                // one `is_done` chunk per stream holds.
                let mut tail = StreamChunk::done();
                stamp(&mut tail, &context, &stream_id);
                match run_chain(&processors, tail).await {
                    ChainOutcome::Emit(chunk) => {
                        let _ = tx.send(chunk).await;
                    }
                    ChainOutcome::Skip => {
                        let mut done = StreamChunk::done();
                        stamp(&mut done, &context, &stream_id);
                        let _ = tx.send(done).await;
                    }
                    ChainOutcome::Fail(error) => {
                        let _ = tx.send(failure_chunk(error, &context, &stream_id)).await;
                    }
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// Same pipeline, emitted as SSE frames.
    pub fn process_stream_bytes(
        &self,
        source: BoxStream<'static, RawChunk>,
        context: StreamContext,
    ) -> impl futures::Stream<Item = Bytes> + Send + 'static {
        self.process_stream(source, context)
            .map(|chunk| chunk.to_sse_bytes())
    }
}

enum ChainOutcome {
    Emit(StreamChunk),
    Skip,
    Fail(ProxyError),
}

async fn run_chain(
    processors: &[Arc<dyn StreamProcessor>],
    mut chunk: StreamChunk,
) -> ChainOutcome {
    for processor in processors {
        match processor.process(chunk).await {
            Ok(next) => {
                chunk = next;
                // A payload-free non-terminal chunk short-circuits the rest
                // of the chain for this chunk.
                if !chunk.has_payload() && !chunk.is_done {
                    break;
                }
            }
            Err(error) => return ChainOutcome::Fail(error),
        }
    }

    if !chunk.has_payload() && !chunk.is_done {
        ChainOutcome::Skip
    } else {
        ChainOutcome::Emit(chunk)
    }
}

fn stamp(chunk: &mut StreamChunk, context: &StreamContext, stream_id: &str) {
    if chunk.metadata.stream_id.is_none() {
        chunk.metadata.stream_id = Some(stream_id.to_string());
    }
    if chunk.metadata.session_id.is_none() {
        chunk.metadata.session_id = context.session_id.clone();
    }
    if chunk.metadata.expected_json.is_none() {
        chunk.metadata.expected_json = context.expected_json;
    }
    if chunk.metadata.content_type.is_none() {
        chunk.metadata.content_type = context.content_type.clone();
    }
    if let Some(schema) = &context.response_schema {
        chunk
            .metadata
            .extra
            .entry("response_schema".to_string())
            .or_insert_with(|| schema.clone());
    }
    if let Some(enabled) = context.loop_detection_enabled {
        chunk
            .metadata
            .extra
            .entry("loop_detection_enabled".to_string())
            .or_insert(json!(enabled));
    }
}

/// Terminal chunk for a pipeline failure. Loop-class errors become
/// cancellation chunks; everything else is an error-flagged final chunk so
/// the caller is not left mid-iteration with a raise.
fn failure_chunk(error: ProxyError, context: &StreamContext, stream_id: &str) -> StreamChunk {
    warn!(stream_id, error = %error, "stream pipeline failure");
    let mut chunk = match &error {
        ProxyError::LoopDetected { .. } | ProxyError::ToolCallLoopDetected { .. } => {
            StreamChunk::cancellation(error.to_string())
        }
        _ => {
            let mut c = StreamChunk::text(error.to_string());
            c.is_done = true;
            c.metadata.error = true;
            c
        }
    };
    stamp(&mut chunk, context, stream_id);
    chunk
}
