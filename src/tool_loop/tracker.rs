//! Signature tracking for tool calls.

use chrono::{DateTime, Duration, Utc};
use json_repair::{to_canonical_string, JsonRepairService};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{ToolCallLoopConfig, ToolLoopMode};

/// A tracked tool call: timestamp plus a canonical fingerprint.
#[derive(Debug, Clone)]
pub struct ToolCallSignature {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    /// Key-sorted canonical serialization of the arguments; the raw argument
    /// string when repair failed (identical raw inputs still collide).
    pub arguments_signature: String,
    pub raw_arguments: String,
}

impl ToolCallSignature {
    pub fn from_tool_call(tool_name: &str, arguments: &str) -> Self {
        let canonical = match JsonRepairService::new().repair(arguments) {
            Ok(value) => to_canonical_string(&value),
            Err(_) => arguments.to_string(),
        };
        Self {
            timestamp: Utc::now(),
            tool_name: tool_name.to_string(),
            arguments_signature: canonical,
            raw_arguments: arguments.to_string(),
        }
    }

    /// `tool_name:canonical_arguments` — the comparison key.
    pub fn full_signature(&self) -> String {
        format!("{}:{}", self.tool_name, self.arguments_signature)
    }

    pub fn is_expired(&self, ttl_seconds: u64, now: DateTime<Utc>) -> bool {
        now - self.timestamp > Duration::seconds(ttl_seconds as i64)
    }
}

/// A blocking decision from the tracker.
#[derive(Debug, Clone)]
pub struct LoopVerdict {
    pub reason: String,
    pub repeat_count: u32,
}

/// Tracks tool calls per session and detects repetitive patterns.
///
/// Owned exclusively by its session; never shared across sessions.
#[derive(Debug, Clone)]
pub struct ToolCallTracker {
    config: ToolCallLoopConfig,
    signatures: Vec<ToolCallSignature>,
    consecutive_repeats: HashMap<String, u32>,
    chance_given: HashMap<String, bool>,
    max_signatures: usize,
}

impl ToolCallTracker {
    pub fn new(config: ToolCallLoopConfig) -> Self {
        Self::with_capacity(config, 100)
    }

    pub fn with_capacity(config: ToolCallLoopConfig, max_signatures: usize) -> Self {
        Self {
            config,
            signatures: Vec::new(),
            consecutive_repeats: HashMap::new(),
            chance_given: HashMap::new(),
            max_signatures,
        }
    }

    pub fn config(&self) -> &ToolCallLoopConfig {
        &self.config
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    /// Remove signatures older than the TTL and rebuild the consecutive-run
    /// counters from the surviving ordered history so no stale counts linger.
    pub fn prune_expired(&mut self) -> usize {
        self.prune_expired_at(Utc::now())
    }

    fn prune_expired_at(&mut self, now: DateTime<Utc>) -> usize {
        if self.signatures.is_empty() {
            return 0;
        }

        let original = self.signatures.len();
        let ttl = self.config.ttl_seconds;
        self.signatures.retain(|sig| !sig.is_expired(ttl, now));
        let pruned = original - self.signatures.len();
        if pruned == 0 {
            return 0;
        }
        debug!(pruned, "pruned expired tool call signatures");

        // Recompute consecutive runs from what survived.
        let mut new_counts: HashMap<String, u32> = HashMap::new();
        let mut current: Option<String> = None;
        let mut run = 0u32;
        for sig in &self.signatures {
            let full = sig.full_signature();
            if Some(&full) == current.as_ref() {
                run += 1;
            } else {
                if let Some(prev) = current.take() {
                    new_counts.insert(prev, run);
                }
                current = Some(full);
                run = 1;
            }
        }
        if let Some(prev) = current {
            new_counts.insert(prev, run);
        }
        self.consecutive_repeats = new_counts;

        // Chance markers only make sense for streaks still at the threshold.
        let threshold = self.config.max_repeats;
        let counts = &self.consecutive_repeats;
        self.chance_given
            .retain(|sig, _| counts.get(sig).is_some_and(|c| *c >= threshold));

        pruned
    }

    /// Track a call and decide whether it must be blocked.
    ///
    /// `force_block` is used by transparent retry to unconditionally return
    /// the after-guidance verdict.
    pub fn track_tool_call(
        &mut self,
        tool_name: &str,
        arguments: &str,
        force_block: bool,
    ) -> Option<LoopVerdict> {
        if !self.config.enabled && !force_block {
            return None;
        }

        if force_block {
            return Some(LoopVerdict {
                reason: self.block_reason(tool_name, self.config.max_repeats, true),
                repeat_count: self.config.max_repeats,
            });
        }

        self.prune_expired();

        let signature = ToolCallSignature::from_tool_call(tool_name, arguments);
        let full = signature.full_signature();

        let is_repeat = self
            .signatures
            .last()
            .is_some_and(|last| last.full_signature() == full);

        let verdict = if is_repeat {
            let count = self.consecutive_repeats.entry(full.clone()).or_insert(1);
            *count += 1;
            let repeat_count = *count;
            debug!(tool = tool_name, repeat_count, "repeated tool call");

            if repeat_count >= self.config.max_repeats {
                match self.config.mode {
                    ToolLoopMode::Break => Some(LoopVerdict {
                        reason: self.block_reason(tool_name, repeat_count, false),
                        repeat_count,
                    }),
                    ToolLoopMode::ChanceThenBreak => {
                        if self.chance_given.get(&full).copied().unwrap_or(false) {
                            Some(LoopVerdict {
                                reason: self.block_reason(tool_name, repeat_count, true),
                                repeat_count,
                            })
                        } else {
                            self.chance_given.insert(full.clone(), true);
                            Some(LoopVerdict {
                                reason: self.chance_reason(tool_name, repeat_count),
                                repeat_count,
                            })
                        }
                    }
                }
            } else {
                None
            }
        } else {
            self.consecutive_repeats.insert(full.clone(), 1);
            self.chance_given.remove(&full);
            None
        };

        if let Some(v) = verdict {
            warn!(
                tool = tool_name,
                repeats = v.repeat_count,
                mode = %self.config.mode,
                "tool call loop threshold reached"
            );
            // Blocked calls are not recorded; the run they belong to already
            // ends the response.
            return Some(v);
        }

        self.signatures.push(signature);
        self.enforce_capacity();
        None
    }

    fn enforce_capacity(&mut self) {
        if self.signatures.len() <= self.max_signatures {
            return;
        }
        let excess = self.signatures.len() - self.max_signatures;
        debug!(excess, "trimming oldest tool call signatures");
        self.signatures.drain(..excess);

        let surviving: std::collections::HashSet<String> = self
            .signatures
            .iter()
            .map(ToolCallSignature::full_signature)
            .collect();
        self.consecutive_repeats.retain(|sig, _| surviving.contains(sig));
        self.chance_given.retain(|sig, _| surviving.contains(sig));
    }

    fn block_reason(&self, tool_name: &str, repeat_count: u32, second_chance: bool) -> String {
        let prefix = if second_chance { "After guidance, " } else { "" };
        format!(
            "{prefix}Tool call loop detected: '{tool_name}' invoked with identical \
             parameters {repeat_count} times within {}s. Session stopped to prevent \
             unintended looping. Try changing your inputs or approach.",
            self.config.ttl_seconds
        )
    }

    fn chance_reason(&self, tool_name: &str, repeat_count: u32) -> String {
        format!(
            "Tool call loop warning: '{tool_name}' has been called with identical \
             parameters {repeat_count} times. Please modify your approach or parameters. \
             If the next call uses the same parameters, the session will be stopped."
        )
    }

    #[cfg(test)]
    fn backdate_all(&mut self, seconds: i64) {
        for sig in &mut self.signatures {
            sig.timestamp -= Duration::seconds(seconds);
        }
    }
}
