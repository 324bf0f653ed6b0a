use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which strategy produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    ShortPattern,
    LongPattern,
}

/// Emitted when a repetition loop is declared on a stream.
#[derive(Debug, Clone, Serialize)]
pub struct LoopDetectionEvent {
    /// The repeating unit (excerpted to 100 chars for long patterns).
    pub pattern: String,
    pub repetition_count: usize,
    /// Total characters covered by the repetitions.
    pub total_length: usize,
    pub confidence: f64,
    /// Last 200 chars of the detector's history at detection time.
    pub buffer_tail: String,
    pub timestamp: DateTime<Utc>,
    pub method: DetectionMethod,
}

impl LoopDetectionEvent {
    /// Excerpt of the pattern suitable for user-facing messages.
    pub fn pattern_excerpt(&self) -> String {
        excerpt(&self.pattern, 30)
    }
}

/// Result of a whole-content loop check (the non-streaming interface).
#[derive(Debug, Clone, Default)]
pub struct LoopCheckResult {
    pub has_loop: bool,
    pub pattern: Option<String>,
    pub repetitions: Option<usize>,
    pub method: Option<DetectionMethod>,
}

impl LoopCheckResult {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn from_event(event: &LoopDetectionEvent) -> Self {
        Self {
            has_loop: true,
            pattern: Some(event.pattern.clone()),
            repetitions: Some(event.repetition_count),
            method: Some(event.method),
        }
    }
}

/// Char-safe prefix excerpt, appending an ellipsis when truncated.
pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max_chars).collect();
    format!("{}...", prefix)
}
