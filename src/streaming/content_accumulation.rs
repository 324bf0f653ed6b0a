//! Stream stage that buffers content and releases it on the terminal chunk,
//! so downstream middleware sees the whole response text at once.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use super::{StreamChunk, StreamProcessor};
use crate::error::ProxyError;

#[derive(Debug, Default)]
struct BufferState {
    chunks: VecDeque<String>,
    byte_length: usize,
    truncation_logged: bool,
    /// Tool calls recovered mid-stream, re-attached to the terminal chunk.
    tool_calls: Vec<chat_protocol::ToolCall>,
}

/// Accumulates per-stream content up to a byte cap. When the cap is exceeded
/// the oldest chunks are dropped, keeping the most recent suffix.
pub struct ContentAccumulationProcessor {
    max_buffer_bytes: usize,
    states: DashMap<String, BufferState>,
}

impl ContentAccumulationProcessor {
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            max_buffer_bytes,
            states: DashMap::new(),
        }
    }
}

impl Default for ContentAccumulationProcessor {
    fn default() -> Self {
        Self::new(10 * 1024 * 1024)
    }
}

#[async_trait]
impl StreamProcessor for ContentAccumulationProcessor {
    fn name(&self) -> &'static str {
        "content_accumulation"
    }

    async fn process(&self, mut chunk: StreamChunk) -> Result<StreamChunk, ProxyError> {
        let stream_id = match chunk.metadata.stream_id.clone() {
            Some(id) => id,
            None => return Ok(chunk),
        };

        // Metadata and usage still flow through on empty chunks so usage
        // accounting downstream keeps working.
        if chunk.content.is_empty()
            && chunk.metadata.tool_calls.is_empty()
            && !chunk.is_done
            && !chunk.is_cancellation
        {
            return Ok(chunk);
        }

        let mut state = self.states.entry(stream_id.clone()).or_default();

        // Tool calls surface on the terminal chunk only.
        state
            .tool_calls
            .append(&mut chunk.metadata.tool_calls);

        if !chunk.content.is_empty() {
            state.byte_length += chunk.content.len();
            state.chunks.push_back(std::mem::take(&mut chunk.content));
        }

        if state.byte_length > self.max_buffer_bytes {
            if !state.truncation_logged {
                warn!(
                    stream_id,
                    cap = self.max_buffer_bytes,
                    current = state.byte_length,
                    "content accumulation cap exceeded, keeping most recent suffix"
                );
                state.truncation_logged = true;
            }
            while state.chunks.len() > 1 && state.byte_length > self.max_buffer_bytes {
                if let Some(removed) = state.chunks.pop_front() {
                    state.byte_length -= removed.len();
                }
            }
        }

        if chunk.is_done || chunk.is_cancellation {
            let full: String = state.chunks.iter().map(String::as_str).collect();
            let calls = std::mem::take(&mut state.tool_calls);
            drop(state);
            self.states.remove(&stream_id);
            chunk.content = full;
            chunk.metadata.tool_calls = calls;
            chunk.is_done = true;
            Ok(chunk)
        } else {
            drop(state);
            chunk.content = String::new();
            Ok(chunk)
        }
    }

    fn reset(&self) {
        self.states.clear();
    }
}
