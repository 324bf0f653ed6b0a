//! Short-pattern detector: sliding window over a bounded history with
//! fixed-size chunk hashing.
//!
//! A loop is declared when the same chunk hash appears `threshold` times and
//! the last `threshold` occurrences sit within an average distance of
//! 1.5 x chunk size of each other. Markdown structure (fences, dividers,
//! headings, lists, tables) resets tracking so repetitive-but-legitimate
//! formatting does not trip the detector, and detection is suspended entirely
//! inside code fences.

use std::collections::HashMap;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::event::{excerpt, DetectionMethod, LoopDetectionEvent};

static DIVIDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+\-_=*\u{2500}-\u{257F}]+$").unwrap());
static HEADING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s+").unwrap());
static BLOCKQUOTE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^>\s+").unwrap());
static LIST_ITEM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:[*+\-]|\d+\.)\s+").unwrap());
static TABLE_BORDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+[-+]+\+").unwrap());

#[derive(Debug, Clone, Copy)]
pub struct ChunkHashConfig {
    /// Repetitions of a chunk needed to declare a loop.
    pub threshold: usize,
    /// Size of the hashed comparison window, in chars.
    pub chunk_size: usize,
    /// Maximum content history to keep, in chars.
    pub max_history: usize,
}

impl Default for ChunkHashConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            chunk_size: 50,
            max_history: 1000,
        }
    }
}

/// Sliding-window chunk-hash loop detector.
#[derive(Debug, Clone)]
pub struct ChunkHashDetector {
    config: ChunkHashConfig,
    history: Vec<char>,
    /// chunk hash -> positions where that chunk started.
    stats: HashMap<u64, Vec<usize>>,
    last_index: usize,
    loop_detected: bool,
    in_code_block: bool,
    enabled: bool,
}

impl ChunkHashDetector {
    pub fn new(config: ChunkHashConfig) -> Self {
        Self {
            config,
            history: Vec::new(),
            stats: HashMap::new(),
            last_index: 0,
            loop_detected: false,
            in_code_block: false,
            enabled: true,
        }
    }

    pub fn config(&self) -> &ChunkHashConfig {
        &self.config
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Feed one chunk of streamed content. Returns an event when a loop is
    /// first declared; afterwards the detector stays silent until reset.
    pub fn process_chunk(&mut self, chunk: &str) -> Option<LoopDetectionEvent> {
        if self.loop_detected || !self.enabled || chunk.is_empty() {
            return None;
        }

        if !self.check_content_loop(chunk) {
            return None;
        }
        self.loop_detected = true;
        warn!(
            threshold = self.config.threshold,
            "content loop detected: chunk repeated within short distance"
        );

        let tail_start = self.history.len().saturating_sub(200);
        let repeated: String = self.history[self.last_index
            ..(self.last_index + self.config.chunk_size).min(self.history.len())]
            .iter()
            .collect();
        Some(LoopDetectionEvent {
            pattern: excerpt(&repeated, 100),
            repetition_count: self.config.threshold,
            total_length: self.config.chunk_size * self.config.threshold,
            confidence: 1.0,
            buffer_tail: self.history[tail_start..].iter().collect(),
            timestamp: Utc::now(),
            method: DetectionMethod::ShortPattern,
        })
    }

    pub fn reset(&mut self) {
        self.reset_tracking();
        self.loop_detected = false;
        self.in_code_block = false;
    }

    fn check_content_loop(&mut self, content: &str) -> bool {
        let num_fences = content.matches("```").count();
        let is_divider = DIVIDER_RE.is_match(content.trim());

        // Fences and dividers are hard content boundaries; lists/headings/
        // tables may be part of the repeating pattern itself, so they reset
        // tracking but are handled separately below.
        if num_fences > 0 || is_divider {
            self.reset_tracking();
            self.loop_detected = false;
        }

        let was_in_code_block = self.in_code_block;
        if num_fences % 2 == 1 {
            self.in_code_block = !self.in_code_block;
        }
        if was_in_code_block || self.in_code_block || is_divider {
            return false;
        }

        if starts_markdown_structure(content) {
            self.reset_tracking();
            self.loop_detected = false;
            return false;
        }

        self.history.extend(content.chars());
        self.truncate_and_update();
        self.analyze_chunks()
    }

    fn truncate_and_update(&mut self) {
        if self.history.len() <= self.config.max_history {
            return;
        }
        let truncation = self.history.len() - self.config.max_history;
        self.history.drain(..truncation);
        self.last_index = self.last_index.saturating_sub(truncation);

        self.stats.retain(|_, positions| {
            positions.retain_mut(|idx| {
                if *idx >= truncation {
                    *idx -= truncation;
                    true
                } else {
                    false
                }
            });
            !positions.is_empty()
        });
    }

    fn analyze_chunks(&mut self) -> bool {
        while self.last_index + self.config.chunk_size <= self.history.len() {
            let window: String = self.history
                [self.last_index..self.last_index + self.config.chunk_size]
                .iter()
                .collect();
            let hash = xxh3_64(window.as_bytes());

            if self.is_loop_for_chunk(&window, hash) {
                return true;
            }
            self.last_index += 1;
        }
        false
    }

    fn is_loop_for_chunk(&mut self, window: &str, hash: u64) -> bool {
        let first = match self.stats.get(&hash) {
            Some(indices) => indices[0],
            None => {
                self.stats.insert(hash, vec![self.last_index]);
                return false;
            }
        };

        // Byte-equal confirmation: a colliding hash must not count.
        let end = (first + self.config.chunk_size).min(self.history.len());
        let original: String = self.history[first..end].iter().collect();
        if original != window {
            return false;
        }

        let indices = match self.stats.get_mut(&hash) {
            Some(indices) => indices,
            None => return false,
        };
        indices.push(self.last_index);
        if indices.len() < self.config.threshold {
            return false;
        }

        let recent = &indices[indices.len() - self.config.threshold..];
        let total_distance = (recent[recent.len() - 1] - recent[0]) as f64;
        let average_distance = total_distance / (self.config.threshold - 1) as f64;
        let max_allowed = self.config.chunk_size as f64 * 1.5;

        average_distance <= max_allowed
    }

    fn reset_tracking(&mut self) {
        debug!("chunk-hash tracking reset");
        self.history.clear();
        self.stats.clear();
        self.last_index = 0;
    }
}

/// Leading markdown structure that indicates a new section.
fn starts_markdown_structure(content: &str) -> bool {
    let stripped = content.trim_start();
    if stripped.is_empty() {
        return false;
    }
    if HEADING_RE.is_match(stripped)
        || BLOCKQUOTE_RE.is_match(stripped)
        || LIST_ITEM_RE.is_match(stripped)
    {
        return true;
    }
    if stripped.starts_with('|') && stripped.matches('|').count() >= 2 {
        return true;
    }
    TABLE_BORDER_RE.is_match(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ChunkHashDetector {
        ChunkHashDetector::new(ChunkHashConfig::default())
    }

    #[test]
    fn test_fires_at_threshold_repetitions() {
        let mut d = detector();
        let chunk = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN"; // 50 chars
        assert_eq!(chunk.len(), 50);

        let mut event = None;
        for _ in 0..10 {
            event = d.process_chunk(chunk);
            if event.is_some() {
                break;
            }
        }
        let event = event.expect("loop should be detected at threshold");
        assert!(event.repetition_count >= 10);
        assert_eq!(event.method, DetectionMethod::ShortPattern);
    }

    #[test]
    fn test_does_not_fire_below_threshold() {
        let mut d = detector();
        let chunk = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN";
        for _ in 0..9 {
            assert!(d.process_chunk(chunk).is_none());
        }
    }

    #[test]
    fn test_varied_content_does_not_fire() {
        let mut d = detector();
        for i in 0..40 {
            let text = format!("sentence number {} with unique content here. ", i * 7919);
            assert!(d.process_chunk(&text).is_none());
        }
    }

    #[test]
    fn test_code_fence_suppresses_detection() {
        let mut d = detector();
        assert!(d.process_chunk("```\n").is_none());
        let chunk = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN";
        for _ in 0..15 {
            assert!(d.process_chunk(chunk).is_none(), "no detection inside fence");
        }
        assert!(d.process_chunk("\n```").is_none());
    }

    #[test]
    fn test_detection_resumes_after_fence_closes() {
        let mut d = detector();
        d.process_chunk("```\ncode\n```");
        let chunk = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN";
        let mut fired = false;
        for _ in 0..12 {
            if d.process_chunk(chunk).is_some() {
                fired = true;
                break;
            }
        }
        assert!(fired, "detector should be live again after the fence closes");
    }

    #[test]
    fn test_divider_resets_tracking() {
        let mut d = detector();
        let chunk = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN";
        for _ in 0..5 {
            d.process_chunk(chunk);
        }
        d.process_chunk("--------------------");
        assert_eq!(d.history_len(), 0);
    }

    #[test]
    fn test_heading_resets_tracking() {
        let mut d = detector();
        d.process_chunk("some plain text that builds up history over time....");
        assert!(d.history_len() > 0);
        d.process_chunk("# A heading\n");
        assert_eq!(d.history_len(), 0);
    }

    #[test]
    fn test_history_truncation_keeps_suffix() {
        let mut d = detector();
        for i in 0..60 {
            d.process_chunk(&format!("unique block {:04} fills history buffer..", i));
        }
        assert!(d.history_len() <= d.config().max_history);
    }

    #[test]
    fn test_disabled_detector_is_silent() {
        let mut d = detector();
        d.disable();
        let chunk = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMN";
        for _ in 0..20 {
            assert!(d.process_chunk(chunk).is_none());
        }
    }
}
