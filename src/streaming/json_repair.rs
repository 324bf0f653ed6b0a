//! Stream stage that detects, buffers and repairs JSON regions.
//!
//! Engagement is gated per response: the stage only processes streams whose
//! metadata signals JSON intent (`expected_json`, a JSON content type, or a
//! configured schema). Ungated streams pass through byte-identical.

use async_trait::async_trait;
use dashmap::DashMap;
use json_repair::JsonRepairService;
use metrics::counter;
use serde_json::Value;
use tracing::warn;

use super::{StreamChunk, StreamProcessor};
use crate::error::ProxyError;

#[derive(Debug, Default)]
struct RepairState {
    buffer: String,
    depth: usize,
    in_string: bool,
    escape: bool,
    started: bool,
    cap_logged: bool,
    schema: Option<Value>,
    engaged: bool,
    resolved: bool,
}

impl RepairState {
    fn reset_region(&mut self) {
        self.buffer.clear();
        self.depth = 0;
        self.in_string = false;
        self.escape = false;
        self.started = false;
    }
}

/// Stateful streaming JSON repair with schema validation gating.
pub struct JsonRepairProcessor {
    service: JsonRepairService,
    buffer_cap_bytes: usize,
    states: DashMap<String, RepairState>,
}

impl JsonRepairProcessor {
    pub fn new(buffer_cap_bytes: usize) -> Self {
        Self {
            service: JsonRepairService::new(),
            buffer_cap_bytes,
            states: DashMap::new(),
        }
    }
}

impl Default for JsonRepairProcessor {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl StreamProcessor for JsonRepairProcessor {
    fn name(&self) -> &'static str {
        "json_repair"
    }

    async fn process(&self, mut chunk: StreamChunk) -> Result<StreamChunk, ProxyError> {
        let stream_id = match chunk.metadata.stream_id.clone() {
            Some(id) => id,
            None => return Ok(chunk),
        };
        if chunk.content.is_empty() && !chunk.is_done {
            return Ok(chunk);
        }

        let mut state = self.states.entry(stream_id.clone()).or_default();

        // Gate decided once per stream from the first chunk's metadata.
        if !state.resolved {
            state.schema = chunk
                .metadata
                .extra
                .get("response_schema")
                .filter(|s| !s.is_null())
                .cloned();
            state.engaged = chunk.metadata.expected_json == Some(true)
                || chunk
                    .metadata
                    .content_type
                    .as_deref()
                    .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"))
                || state.schema.is_some();
            state.resolved = true;
        }

        if !state.engaged {
            drop(state);
            if chunk.is_done {
                self.states.remove(&stream_id);
            }
            return Ok(chunk);
        }

        let mut out = String::new();
        let result = scan_chunk(state.value_mut(), &chunk.content, &self.service, &mut out);
        if let Err(e) = result {
            drop(state);
            self.states.remove(&stream_id);
            return Err(e);
        }

        if state.started && state.buffer.len() > self.buffer_cap_bytes && !state.cap_logged {
            // Correctness beats truncation: keep buffering, but say so once.
            warn!(
                stream_id,
                cap = self.buffer_cap_bytes,
                "JSON repair buffer cap exceeded, continuing to buffer"
            );
            state.cap_logged = true;
        }

        if chunk.is_done {
            let mut flush_result = Ok(());
            if state.started && !state.buffer.is_empty() {
                let mut pending = std::mem::take(&mut state.buffer);
                if !state.in_string && pending.trim_end().ends_with(':') {
                    pending.push_str(" null");
                }
                flush_result = flush_region(&state.schema, &pending, &self.service, &mut out);
            }
            drop(state);
            self.states.remove(&stream_id);
            flush_result?;
        } else {
            drop(state);
        }

        chunk.content = out;
        Ok(chunk)
    }

    fn reset(&self) {
        self.states.clear();
    }
}

/// Walk the chunk text, passing through non-JSON spans and buffering JSON
/// regions until their top-level container closes.
fn scan_chunk(
    state: &mut RepairState,
    text: &str,
    service: &JsonRepairService,
    out: &mut String,
) -> Result<(), ProxyError> {
    let mut rest = text;

    while !rest.is_empty() {
        if !state.started {
            match rest.find(['{', '[']) {
                None => {
                    out.push_str(rest);
                    break;
                }
                Some(start) => {
                    out.push_str(&rest[..start]);
                    let ch = rest.as_bytes()[start] as char;
                    state.started = true;
                    state.buffer.clear();
                    state.buffer.push(ch);
                    state.depth = 1;
                    state.in_string = false;
                    state.escape = false;
                    rest = &rest[start + 1..];
                }
            }
            continue;
        }

        let mut consumed = rest.len();
        let mut complete = false;
        for (i, ch) in rest.char_indices() {
            if state.in_string {
                if state.escape {
                    state.escape = false;
                } else if ch == '\\' {
                    state.escape = true;
                } else if ch == '"' {
                    state.in_string = false;
                }
            } else {
                match ch {
                    '"' => state.in_string = true,
                    '{' | '[' => state.depth += 1,
                    '}' | ']' => state.depth = state.depth.saturating_sub(1),
                    _ => {}
                }
            }
            state.buffer.push(ch);

            if state.depth == 0 && !state.in_string {
                consumed = i + ch.len_utf8();
                complete = true;
                break;
            }
        }
        rest = &rest[consumed..];

        if complete {
            let region = std::mem::take(&mut state.buffer);
            flush_region(&state.schema, &region, service, out)?;
            state.reset_region();
        }
    }
    Ok(())
}

/// Repair (and validate when a schema is present) a completed JSON region.
/// A configured schema means strict mode: validation failures raise. Without
/// a schema, repair failures fall back to the raw buffered text.
fn flush_region(
    schema: &Option<Value>,
    region: &str,
    service: &JsonRepairService,
    out: &mut String,
) -> Result<(), ProxyError> {
    let strict = schema.is_some();
    match service.repair_and_validate(region, schema.as_ref(), strict) {
        Ok(Some(value)) => {
            counter!("lpg_json_repair_stream_success").increment(1);
            out.push_str(&value.to_string());
            Ok(())
        }
        Ok(None) => {
            counter!("lpg_json_repair_stream_fallback").increment(1);
            warn!("JSON region failed to repair, flushing raw buffer");
            out.push_str(region);
            Ok(())
        }
        Err(e) => {
            counter!("lpg_json_repair_stream_strict_fail").increment(1);
            Err(ProxyError::parsing(format!(
                "strict JSON validation failed: {e}"
            )))
        }
    }
}
