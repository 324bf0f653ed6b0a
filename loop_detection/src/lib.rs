//! Hybrid repetition detector for streamed LLM output.
//!
//! Two complementary strategies run over every response:
//!
//! 1. [`ChunkHashDetector`] — a sliding-window chunk-hash detector for short
//!    patterns (at or below the chunk size). Fast, context-aware, resets on
//!    markdown boundaries and is suspended inside code fences.
//! 2. [`RollingHashDetector`] — a Rabin-Karp rolling hash for long patterns
//!    (60..=500 chars) that the chunk detector cannot see.
//!
//! [`HybridLoopDetector`] combines both; whichever fires first wins and
//! silences further detection for the stream.

mod chunk_hash;
mod event;
mod hybrid;
mod rolling_hash;

pub use chunk_hash::{ChunkHashConfig, ChunkHashDetector};
pub use event::{DetectionMethod, LoopCheckResult, LoopDetectionEvent};
pub use hybrid::{HybridConfig, HybridLoopDetector};
pub use rolling_hash::{RollingHashConfig, RollingHashDetector};
