//! Tool-call loop detection: signature tracking with TTL pruning.
//!
//! Models stuck in a loop re-issue the same tool call with identical
//! arguments. The tracker fingerprints every structured call and blocks the
//! response once a signature repeats consecutively past the configured
//! threshold within the TTL window.

mod tracker;

pub use tracker::{LoopVerdict, ToolCallSignature, ToolCallTracker};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How to handle a detected tool call loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolLoopMode {
    /// Block immediately at the threshold.
    #[default]
    Break,
    /// Block once with guidance, then break if the model repeats anyway.
    ChanceThenBreak,
}

impl fmt::Display for ToolLoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Break => write!(f, "break"),
            Self::ChanceThenBreak => write!(f, "chance_then_break"),
        }
    }
}

impl FromStr for ToolLoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "break" => Ok(Self::Break),
            // "chance" is accepted shorthand.
            "chance" | "chance_then_break" => Ok(Self::ChanceThenBreak),
            other => Err(format!("unknown tool loop mode: {other}")),
        }
    }
}

/// Configuration for tool call loop detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolCallLoopConfig {
    pub enabled: bool,
    /// Consecutive identical calls before action is taken.
    pub max_repeats: u32,
    /// Window in seconds for considering calls part of a pattern.
    pub ttl_seconds: u64,
    pub mode: ToolLoopMode,
}

impl Default for ToolCallLoopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_repeats: 4,
            ttl_seconds: 120,
            mode: ToolLoopMode::Break,
        }
    }
}

impl ToolCallLoopConfig {
    /// Validate and return the list of problems, empty when the config is
    /// usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_repeats < 2 {
            errors.push("max_repeats must be at least 2".to_string());
        }
        if self.ttl_seconds < 1 {
            errors.push("ttl_seconds must be positive".to_string());
        }
        errors
    }
}
