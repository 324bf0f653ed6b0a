//! Recovers tool calls that arrived as free text instead of structured
//! `tool_calls`.
//!
//! Accepted surface forms:
//!
//! 1. Fenced code blocks: ```` ```json {"function_call": {...}} ``` ````
//! 2. Inline JSON carrying a `"function_call"` or `"tool"` key, located with
//!    a balanced-brace scanner (string- and escape-aware, never regex) so
//!    arbitrarily nested arguments work.
//! 3. Textual forms: `TOOL CALL: name {args}`, `Function call: name {args}`,
//!    `Call: name {args}`.
//!
//! Every detected call is normalized to the OpenAI structured shape with a
//! fresh `call_` id. Arguments that fail to parse as JSON are wrapped as
//! `{"args": "<raw>"}`.

mod scan;
mod streaming;

pub use scan::{find_balanced_object_end, find_object_start_before};
pub use streaming::{ScanOutcome, StreamingToolCallScanner};

use chat_protocol::ToolCall;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

static CODE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").unwrap());
static TEXT_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)(?:TOOL CALL|Function call|Call)\s*:\s*(\w+)\s*(.*)").unwrap());

/// Detects tool calls embedded as text and converts them to the structured
/// OpenAI-compatible form.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCallRepairService;

impl ToolCallRepairService {
    pub fn new() -> Self {
        Self
    }

    /// Scan `content` for a textual tool call. Returns the structured call
    /// when one is found and parses.
    pub fn repair_tool_calls(&self, content: &str) -> Option<ToolCall> {
        if content.is_empty() {
            return None;
        }

        // Cheap substring gates before any regex work.
        if content.contains("```") {
            if let Some(captures) = CODE_BLOCK_RE.captures(content) {
                if let Some(call) = process_json_payload(captures.get(1)?.as_str()) {
                    return Some(call);
                }
            }
        }

        if content.contains("\"function_call\"") || content.contains("\"tool\"") {
            if let Some(extracted) = extract_json_object_near_key(content) {
                if let Some(call) = process_json_payload(extracted) {
                    return Some(call);
                }
            }
        }

        if content.contains("TOOL CALL")
            || content.contains("Function call")
            || content.contains("Call:")
        {
            if let Some(captures) = TEXT_CALL_RE.captures(content) {
                let name = captures.get(1)?.as_str();
                let args = captures.get(2)?.as_str();
                return Some(process_text_payload(name, args));
            }
        }

        None
    }
}

/// Interpret a JSON payload as a tool call. Accepts `{"function_call": {...}}`,
/// `{"tool": {...}}` and a bare `{"name": …, "arguments": …}` object.
pub(crate) fn process_json_payload(json_string: &str) -> Option<ToolCall> {
    let data: Value = match serde_json::from_str(json_string) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "failed to decode JSON for tool call repair");
            return None;
        }
    };

    let call_object = data
        .get("function_call")
        .or_else(|| data.get("tool"))
        .and_then(Value::as_object);

    if let Some(object) = call_object {
        let name = object.get("name").and_then(Value::as_str).unwrap_or("");
        return Some(format_call(name, object.get("arguments")));
    }

    if data.get("name").is_some() && data.get("arguments").is_some() {
        let name = data.get("name").and_then(Value::as_str).unwrap_or("");
        return Some(format_call(name, data.get("arguments")));
    }

    None
}

pub(crate) fn process_text_payload(name: &str, args: &str) -> ToolCall {
    let trimmed = args.trim();
    let arguments = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value.to_string(),
        Err(_) => serde_json::json!({ "args": trimmed }).to_string(),
    };
    debug!(tool = name, "textual tool call repaired");
    ToolCall::function(name, arguments)
}

fn format_call(name: &str, arguments: Option<&Value>) -> ToolCall {
    let arguments = match arguments {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => "{}".to_string(),
    };
    ToolCall::function(name, arguments)
}

/// Extract a balanced JSON object containing a `"function_call"` or `"tool"`
/// key by scanning braces, ignoring braces inside strings.
pub(crate) fn extract_json_object_near_key(text: &str) -> Option<&str> {
    let key_idx = text
        .find("\"function_call\"")
        .or_else(|| text.find("\"tool\""))?;
    let start = find_object_start_before(text, key_idx)?;
    let end = find_balanced_object_end(text, start)?;
    Some(&text[start..=end])
}
