//! Hybrid detector: chunk-hash for short patterns, rolling hash for long ones.
//!
//! Both strategies are always active; the short path runs first because it is
//! cheaper and covers the common case. Whichever fires first produces the
//! event, and the stream owner is expected to stop feeding the detector.

use chrono::Utc;
use tracing::info;

use crate::chunk_hash::{ChunkHashConfig, ChunkHashDetector};
use crate::event::{excerpt, DetectionMethod, LoopCheckResult, LoopDetectionEvent};
use crate::rolling_hash::{RollingHashConfig, RollingHashDetector};

#[derive(Debug, Clone, Copy, Default)]
pub struct HybridConfig {
    pub short: ChunkHashConfig,
    pub long: RollingHashConfig,
}

/// Combined short/long pattern loop detector. Single-owner: one instance per
/// stream, never shared.
#[derive(Debug, Clone)]
pub struct HybridLoopDetector {
    short: ChunkHashDetector,
    long: RollingHashDetector,
    enabled: bool,
    events: Vec<LoopDetectionEvent>,
}

impl Default for HybridLoopDetector {
    fn default() -> Self {
        Self::new(HybridConfig::default())
    }
}

impl HybridLoopDetector {
    pub fn new(config: HybridConfig) -> Self {
        Self {
            short: ChunkHashDetector::new(config.short),
            long: RollingHashDetector::new(config.long),
            enabled: true,
            events: Vec::new(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.short.enable();
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.short.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Detection events recorded since the last reset.
    pub fn events(&self) -> &[LoopDetectionEvent] {
        &self.events
    }

    pub fn reset(&mut self) {
        self.short.reset();
        self.long.reset();
        self.events.clear();
    }

    /// Process one chunk through both strategies. Short patterns are checked
    /// first; the long path only runs when the short path stayed quiet.
    pub fn process_chunk(&mut self, chunk: &str) -> Option<LoopDetectionEvent> {
        if !self.enabled || chunk.is_empty() {
            return None;
        }

        if let Some(event) = self.short.process_chunk(chunk) {
            self.events.push(event.clone());
            return Some(event);
        }

        if let Some((pattern, repetitions)) = self.long.add_content(chunk) {
            let pattern_len = pattern.chars().count();
            let event = LoopDetectionEvent {
                pattern: excerpt(&pattern, 100),
                repetition_count: repetitions,
                total_length: pattern_len * repetitions,
                confidence: 1.0,
                buffer_tail: self.long.tail(200),
                timestamp: Utc::now(),
                method: DetectionMethod::LongPattern,
            };
            self.events.push(event.clone());
            info!(
                repetitions,
                pattern_chars = pattern_len,
                "long-pattern loop event recorded"
            );
            return Some(event);
        }

        None
    }

    /// Check a whole piece of content for loops without disturbing in-flight
    /// streaming state: state is saved, the content is run through a clean
    /// detector, and the original state restored.
    pub fn check_for_loops(&mut self, content: &str) -> LoopCheckResult {
        if content.is_empty() {
            return LoopCheckResult::clean();
        }

        let saved_short = self.short.clone();
        let saved_long = self.long.clone();
        let saved_events = std::mem::take(&mut self.events);

        self.short.reset();
        self.long.reset();
        let event = self.process_chunk(content);

        self.short = saved_short;
        self.long = saved_long;
        self.events = saved_events;

        match event {
            Some(event) => LoopCheckResult::from_event(&event),
            None => LoopCheckResult::clean(),
        }
    }
}
