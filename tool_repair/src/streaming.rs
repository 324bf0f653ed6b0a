//! Incremental tool-call recovery for streamed content.
//!
//! The scanner owns a per-stream buffer. Text flows through untouched until a
//! trigger (code fence, `"function_call"` / `"tool"` key, or a textual
//! `TOOL CALL:` form) is seen; from there the scanner buffers until the call
//! closes, emits the structured call, and resumes pass-through. Text before
//! and after a recognized call is forwarded in order.

use chat_protocol::ToolCall;
use serde_json::Value;
use tracing::{debug, warn};

use crate::scan::{find_balanced_object_end, find_object_start_before, partial_token_suffix};
use crate::{process_json_payload, process_text_payload, ToolCallRepairService};

const FENCE: &str = "```";
const KEY_FUNCTION_CALL: &str = "\"function_call\"";
const KEY_TOOL: &str = "\"tool\"";
const TEXT_TRIGGERS: [&str; 3] = ["TOOL CALL", "Function call", "Call:"];

const DEFAULT_MAX_BUFFER_BYTES: usize = 64 * 1024;

/// What one `feed` produced: pass-through text (in order) and any completed
/// structured calls.
#[derive(Debug, Default, Clone)]
pub struct ScanOutcome {
    pub text: String,
    pub calls: Vec<ToolCall>,
}

impl ScanOutcome {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.calls.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Trigger {
    Fence,
    JsonKey,
    Textual,
}

/// Stateful per-stream scanner. Single-owner; one instance per `stream_id`.
#[derive(Debug)]
pub struct StreamingToolCallScanner {
    buffer: String,
    max_buffer_bytes: usize,
    overflow_logged: bool,
}

impl Default for StreamingToolCallScanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES)
    }
}

impl StreamingToolCallScanner {
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            buffer: String::new(),
            max_buffer_bytes,
            overflow_logged: false,
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one chunk of streamed text.
    pub fn feed(&mut self, text: &str) -> ScanOutcome {
        self.buffer.push_str(text);
        let mut outcome = ScanOutcome::default();

        if self.buffer.len() > self.max_buffer_bytes {
            if !self.overflow_logged {
                warn!(
                    cap = self.max_buffer_bytes,
                    "tool-call buffer cap exceeded, flushing as plain text"
                );
                self.overflow_logged = true;
            }
            outcome.text = std::mem::take(&mut self.buffer);
            return outcome;
        }

        loop {
            let Some((pos, trigger)) = self.earliest_trigger() else {
                // No trigger: pass everything through except a tail that might
                // be the start of one split across chunks.
                let hold = self.partial_trigger_tail();
                let emit_to = self.buffer.len() - hold;
                outcome.text.push_str(&self.buffer[..emit_to]);
                self.buffer.drain(..emit_to);
                break;
            };

            let done = match trigger {
                Trigger::Fence => self.consume_fence(pos, &mut outcome),
                Trigger::JsonKey => self.consume_json_object(pos, &mut outcome),
                Trigger::Textual => self.consume_textual(pos, &mut outcome),
            };
            if !done {
                break;
            }
        }

        outcome
    }

    /// Flush at end of stream. A still-pending region gets one last chance
    /// through the buffered repair path, then falls back to plain text.
    pub fn finish(&mut self) -> ScanOutcome {
        let remaining = std::mem::take(&mut self.buffer);
        if remaining.is_empty() {
            return ScanOutcome::default();
        }

        if let Some(call) = ToolCallRepairService::new().repair_tool_calls(&remaining) {
            debug!(tool = %call.function.name, "pending tool call completed at end of stream");
            return ScanOutcome {
                text: String::new(),
                calls: vec![call],
            };
        }

        ScanOutcome {
            text: remaining,
            calls: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.overflow_logged = false;
    }

    fn earliest_trigger(&self) -> Option<(usize, Trigger)> {
        let mut best: Option<(usize, Trigger)> = None;
        let mut consider = |pos: Option<usize>, trigger: Trigger| {
            if let Some(p) = pos {
                if best.is_none() || p < best.unwrap().0 {
                    best = Some((p, trigger));
                }
            }
        };

        consider(self.buffer.find(FENCE), Trigger::Fence);
        consider(self.buffer.find(KEY_FUNCTION_CALL), Trigger::JsonKey);
        consider(self.buffer.find(KEY_TOOL), Trigger::JsonKey);
        for t in TEXT_TRIGGERS {
            consider(self.buffer.find(t), Trigger::Textual);
        }
        best
    }

    fn partial_trigger_tail(&self) -> usize {
        let mut hold = 0;
        for token in [FENCE, KEY_FUNCTION_CALL, KEY_TOOL].iter().copied() {
            hold = hold.max(partial_token_suffix(&self.buffer, token));
        }
        for token in TEXT_TRIGGERS {
            hold = hold.max(partial_token_suffix(&self.buffer, token));
        }
        hold.max(self.json_key_hold())
    }

    /// Hold back from a trailing `{` when what follows could still become a
    /// `"function_call"` / `"tool"` key. Without this the opening brace of an
    /// inline call would be flushed as text before the key finishes arriving.
    fn json_key_hold(&self) -> usize {
        let Some(brace) = self.buffer.rfind('{') else {
            return 0;
        };
        let tail = self.buffer[brace + 1..].trim_start();
        for key in [KEY_FUNCTION_CALL, KEY_TOOL] {
            if key.starts_with(tail) {
                return self.buffer.len() - brace;
            }
        }
        0
    }

    /// Returns true when the region was fully consumed and scanning can
    /// continue, false when more input is needed.
    fn consume_fence(&mut self, pos: usize, outcome: &mut ScanOutcome) -> bool {
        let inner_start = pos + FENCE.len();
        let Some(close_rel) = self.buffer[inner_start..].find(FENCE) else {
            outcome.text.push_str(&self.buffer[..pos]);
            self.buffer.drain(..pos);
            return false;
        };
        let close = inner_start + close_rel;
        let block_end = close + FENCE.len();

        let inner = &self.buffer[inner_start..close];
        let call = inner
            .find('{')
            .and_then(|brace| {
                find_balanced_object_end(inner, brace).map(|end| &inner[brace..=end])
            })
            .and_then(process_json_payload);

        outcome.text.push_str(&self.buffer[..pos]);
        match call {
            Some(call) => outcome.calls.push(call),
            // An ordinary code block: forward it untouched.
            None => outcome.text.push_str(&self.buffer[pos..block_end]),
        }
        self.buffer.drain(..block_end);
        true
    }

    fn consume_json_object(&mut self, key_pos: usize, outcome: &mut ScanOutcome) -> bool {
        let Some(start) = find_object_start_before(&self.buffer, key_pos) else {
            // Key with no enclosing object: it is just text.
            let end = key_pos + 1;
            outcome.text.push_str(&self.buffer[..end]);
            self.buffer.drain(..end);
            return true;
        };

        let Some(end) = find_balanced_object_end(&self.buffer, start) else {
            outcome.text.push_str(&self.buffer[..start]);
            self.buffer.drain(..start);
            return false;
        };

        outcome.text.push_str(&self.buffer[..start]);
        let payload = &self.buffer[start..=end];
        match process_json_payload(payload) {
            Some(call) => outcome.calls.push(call),
            None => outcome.text.push_str(payload),
        }
        self.buffer.drain(..=end);
        true
    }

    fn consume_textual(&mut self, pos: usize, outcome: &mut ScanOutcome) -> bool {
        let after = &self.buffer[pos..];
        let token_len = TEXT_TRIGGERS
            .iter()
            .find(|t| after.starts_with(*t))
            .map(|t| t.len())
            .unwrap_or(1);

        // The colon must sit close to the trigger word; "TOOL CALL" deep in
        // prose is not call syntax and must not stall the stream.
        let mut window_end = (token_len + 8).min(after.len());
        while window_end > 0 && !after.is_char_boundary(window_end) {
            window_end -= 1;
        }
        let colon_rel = match after[..window_end].find(':') {
            Some(c) => c,
            None => {
                if after.len() >= token_len + 8 {
                    let end = pos + token_len;
                    outcome.text.push_str(&self.buffer[..end]);
                    self.buffer.drain(..end);
                    return true;
                }
                outcome.text.push_str(&self.buffer[..pos]);
                self.buffer.drain(..pos);
                return false;
            }
        };

        let rest = &after[colon_rel + 1..];
        let name: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if name.is_empty() {
            // Nothing callable yet; wait for more input unless the line ended.
            if rest.contains('\n') {
                let end = pos + colon_rel + 1;
                outcome.text.push_str(&self.buffer[..end]);
                self.buffer.drain(..end);
                return true;
            }
            outcome.text.push_str(&self.buffer[..pos]);
            self.buffer.drain(..pos);
            return false;
        }

        match rest.find('{') {
            Some(brace_rel) => {
                let brace_abs = pos + colon_rel + 1 + brace_rel;
                let Some(end) = find_balanced_object_end(&self.buffer, brace_abs) else {
                    outcome.text.push_str(&self.buffer[..pos]);
                    self.buffer.drain(..pos);
                    return false;
                };
                let args = self.buffer[brace_abs..=end].to_string();
                outcome.text.push_str(&self.buffer[..pos]);
                outcome.calls.push(process_text_payload(&name, &args));
                self.buffer.drain(..=end);
                true
            }
            None => {
                // Raw textual args run to the end of the line.
                match rest.find('\n') {
                    Some(nl_rel) => {
                        let args_start = colon_rel + 1 + name_offset(rest, &name);
                        let args_end = colon_rel + 1 + nl_rel;
                        let args = after[args_start..args_end].trim().to_string();
                        outcome.text.push_str(&self.buffer[..pos]);
                        outcome.calls.push(process_text_payload(&name, &args));
                        let drain_to = pos + args_end;
                        self.buffer.drain(..drain_to);
                        true
                    }
                    None => {
                        outcome.text.push_str(&self.buffer[..pos]);
                        self.buffer.drain(..pos);
                        false
                    }
                }
            }
        }
    }
}

/// Byte offset of the end of `name` within `rest` (which begins after the
/// trigger's colon).
fn name_offset(rest: &str, name: &str) -> usize {
    let leading = rest.len() - rest.trim_start().len();
    leading + name.len()
}

impl StreamingToolCallScanner {
    /// Convenience for tests: run a full message through the scanner.
    pub fn scan_complete(text: &str) -> ScanOutcome {
        let mut scanner = Self::default();
        let mut outcome = scanner.feed(text);
        let tail = scanner.finish();
        outcome.text.push_str(&tail.text);
        outcome.calls.extend(tail.calls);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_passes_through() {
        let mut scanner = StreamingToolCallScanner::default();
        let out = scanner.feed("hello world, nothing to see");
        assert_eq!(out.text, "hello world, nothing to see");
        assert!(out.calls.is_empty());
    }

    #[test]
    fn test_call_split_across_chunks() {
        let mut scanner = StreamingToolCallScanner::default();
        let mut text = String::new();
        let mut calls = Vec::new();

        for chunk in [
            "Working on it. ",
            "TOOL CA",
            "LL: myfunc {\"x\"",
            ": 1} and done.",
        ] {
            let out = scanner.feed(chunk);
            text.push_str(&out.text);
            calls.extend(out.calls);
        }
        let tail = scanner.finish();
        text.push_str(&tail.text);
        calls.extend(tail.calls);

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "myfunc");
        assert_eq!(text, "Working on it.  and done.");
    }

    #[test]
    fn test_inline_json_call_pre_and_post_text_ordered() {
        let out = StreamingToolCallScanner::scan_complete(
            r#"before {"function_call": {"name": "f", "arguments": {}}} after"#,
        );
        assert_eq!(out.text, "before  after");
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].function.name, "f");
    }

    #[test]
    fn test_ordinary_code_block_forwarded() {
        let input = "look:\n```\nfn main() {}\n```\ndone";
        let out = StreamingToolCallScanner::scan_complete(input);
        assert!(out.calls.is_empty());
        assert_eq!(out.text, input);
    }

    #[test]
    fn test_fenced_call_extracted() {
        let input = "```json\n{\"function_call\": {\"name\": \"go\", \"arguments\": {\"n\": 2}}}\n```";
        let out = StreamingToolCallScanner::scan_complete(input);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].function.name, "go");
        assert_eq!(out.text.trim(), "");
    }

    #[test]
    fn test_buffer_cap_flushes_as_text() {
        let mut scanner = StreamingToolCallScanner::new(128);
        // An opening trigger with no close, fed past the cap.
        let mut collected = String::new();
        let out = scanner.feed("TOOL CALL: f {\"data\": \"");
        collected.push_str(&out.text);
        let filler = "x".repeat(200);
        let out = scanner.feed(&filler);
        collected.push_str(&out.text);
        assert!(collected.contains("TOOL CALL"));
        assert_eq!(scanner.buffered_len(), 0);
    }

    #[test]
    fn test_two_scanners_are_independent() {
        let mut a = StreamingToolCallScanner::default();
        let mut b = StreamingToolCallScanner::default();

        a.feed("TOOL CALL: alpha {\"v\"");
        b.feed("TOOL CALL: beta {\"v\"");
        let out_a = a.feed(": 1}");
        let out_b = b.feed(": 2}");

        assert_eq!(out_a.calls[0].function.name, "alpha");
        assert_eq!(out_b.calls[0].function.name, "beta");
    }
}
