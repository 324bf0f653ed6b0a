//! Long-pattern detector: Rabin-Karp rolling hash over a bounded history.
//!
//! Catches repetitions whose unit is longer than the chunk-hash window
//! (60..=500 chars). Longer candidate lengths are tried first so the most
//! specific pattern wins. Hash matches are confirmed with a direct content
//! comparison, and far-scattered coincidences are rejected with a span bound.

use std::collections::HashMap;

use tracing::warn;

const HASH_BASE: u64 = 31;
const HASH_MOD: u64 = (1 << 32) - 1;

#[derive(Debug, Clone, Copy)]
pub struct RollingHashConfig {
    /// Minimum length to consider as a "long pattern", in chars.
    pub min_pattern_length: usize,
    /// Maximum pattern length to check.
    pub max_pattern_length: usize,
    /// Repetitions needed to declare a loop.
    pub min_repetitions: usize,
    /// Maximum content to keep for analysis, in chars.
    pub max_history: usize,
}

impl Default for RollingHashConfig {
    fn default() -> Self {
        Self {
            min_pattern_length: 60,
            max_pattern_length: 500,
            min_repetitions: 3,
            max_history: 2000,
        }
    }
}

/// Rolling-hash repetition tracker.
#[derive(Debug, Clone)]
pub struct RollingHashDetector {
    config: RollingHashConfig,
    content: Vec<char>,
    /// powers[i] = HASH_BASE^i mod HASH_MOD, precomputed up to the maximum
    /// pattern length.
    powers: Vec<u64>,
}

impl RollingHashDetector {
    pub fn new(config: RollingHashConfig) -> Self {
        let mut powers = Vec::with_capacity(config.max_pattern_length + 1);
        let mut power = 1u64;
        powers.push(power);
        for _ in 1..=config.max_pattern_length {
            power = power * HASH_BASE % HASH_MOD;
            powers.push(power);
        }
        Self {
            config,
            content: Vec::new(),
            powers,
        }
    }

    pub fn config(&self) -> &RollingHashConfig {
        &self.config
    }

    pub fn content_len(&self) -> usize {
        self.content.len()
    }

    /// Last `n` chars of the tracked content.
    pub fn tail(&self, n: usize) -> String {
        let start = self.content.len().saturating_sub(n);
        self.content[start..].iter().collect()
    }

    pub fn reset(&mut self) {
        self.content.clear();
    }

    /// Add new content and check for long pattern repetitions. Returns the
    /// repeated pattern and its occurrence count when a loop is found.
    pub fn add_content(&mut self, new_content: &str) -> Option<(String, usize)> {
        if new_content.is_empty() {
            return None;
        }
        self.content.extend(new_content.chars());

        if self.content.len() > self.config.max_history {
            let truncate = self.content.len() - self.config.max_history;
            self.content.drain(..truncate);
        }

        if self.content.len() < self.config.min_pattern_length * self.config.min_repetitions {
            return None;
        }

        // Longer patterns first: the most specific match wins.
        let upper = self
            .config
            .max_pattern_length
            .min(self.content.len() / self.config.min_repetitions);
        for pattern_length in (self.config.min_pattern_length..=upper).rev() {
            if let Some(found) = self.check_pattern_length(pattern_length) {
                warn!(
                    repetitions = found.1,
                    pattern_chars = pattern_length,
                    "long-pattern loop detected"
                );
                return Some(found);
            }
        }
        None
    }

    fn check_pattern_length(&self, pattern_length: usize) -> Option<(String, usize)> {
        if self.content.len() < pattern_length * self.config.min_repetitions {
            return None;
        }

        let mut hash_positions: HashMap<u64, Vec<usize>> = HashMap::new();

        let mut current_hash: u64 = 0;
        for &ch in &self.content[..pattern_length] {
            current_hash = (current_hash * HASH_BASE + ch as u64) % HASH_MOD;
        }
        hash_positions.insert(current_hash, vec![0]);

        for i in 1..=self.content.len() - pattern_length {
            let old_char = self.content[i - 1] as u64;
            let new_char = self.content[i + pattern_length - 1] as u64;

            let removed = old_char * self.powers[pattern_length - 1] % HASH_MOD;
            current_hash = (current_hash + HASH_MOD - removed) % HASH_MOD;
            current_hash = (current_hash * HASH_BASE + new_char) % HASH_MOD;

            hash_positions.entry(current_hash).or_default().push(i);
        }

        for positions in hash_positions.values() {
            if positions.len() >= self.config.min_repetitions
                && self.verify_pattern_match(positions, pattern_length)
            {
                let pattern: String = self.content[positions[0]..positions[0] + pattern_length]
                    .iter()
                    .collect();
                return Some((pattern, positions.len()));
            }
        }
        None
    }

    /// Confirm that hash-matching positions actually contain the same pattern
    /// and sit close enough together to be a loop rather than coincidence.
    fn verify_pattern_match(&self, positions: &[usize], pattern_length: usize) -> bool {
        if positions.len() < 2 {
            return false;
        }

        let span = positions[positions.len() - 1] - positions[0];
        if span > pattern_length * positions.len() * 2 {
            return false;
        }

        let reference = &self.content[positions[0]..positions[0] + pattern_length];
        for &pos in &positions[1..] {
            if pos + pattern_length > self.content.len() {
                return false;
            }
            if &self.content[pos..pos + pattern_length] != reference {
                return false;
            }
        }
        true
    }
}
