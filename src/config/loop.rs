//! Per-session loop-detection configuration.

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::tool_loop::{ToolCallLoopConfig, ToolLoopMode};

/// Immutable loop-detection settings carried by a session.
///
/// Mutation is expressed through `with_*` copy builders; the record itself is
/// never updated in place. Sessions swap in the new value wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDetectionConfiguration {
    pub loop_detection_enabled: bool,
    pub tool_loop_detection_enabled: bool,
    pub min_pattern_length: u32,
    pub max_pattern_length: u32,
    pub tool_loop_max_repeats: Option<u32>,
    pub tool_loop_ttl_seconds: Option<u64>,
    pub tool_loop_mode: Option<ToolLoopMode>,
}

impl Default for LoopDetectionConfiguration {
    fn default() -> Self {
        Self {
            loop_detection_enabled: true,
            tool_loop_detection_enabled: true,
            min_pattern_length: 100,
            max_pattern_length: 8000,
            tool_loop_max_repeats: None,
            tool_loop_ttl_seconds: None,
            tool_loop_mode: None,
        }
    }
}

impl LoopDetectionConfiguration {
    pub fn with_loop_detection_enabled(&self, enabled: bool) -> Self {
        Self {
            loop_detection_enabled: enabled,
            ..self.clone()
        }
    }

    pub fn with_tool_loop_detection_enabled(&self, enabled: bool) -> Self {
        Self {
            tool_loop_detection_enabled: enabled,
            ..self.clone()
        }
    }

    pub fn with_pattern_length_range(&self, min: u32, max: u32) -> Self {
        Self {
            min_pattern_length: min,
            max_pattern_length: max,
            ..self.clone()
        }
    }

    pub fn with_tool_loop_max_repeats(&self, max_repeats: u32) -> Result<Self, ProxyError> {
        if max_repeats < 2 {
            return Err(ProxyError::validation(
                "tool call loop max repeats must be at least 2",
            ));
        }
        Ok(Self {
            tool_loop_max_repeats: Some(max_repeats),
            ..self.clone()
        })
    }

    pub fn with_tool_loop_ttl_seconds(&self, ttl_seconds: u64) -> Result<Self, ProxyError> {
        if ttl_seconds < 1 {
            return Err(ProxyError::validation(
                "tool call loop TTL seconds must be at least 1",
            ));
        }
        Ok(Self {
            tool_loop_ttl_seconds: Some(ttl_seconds),
            ..self.clone()
        })
    }

    pub fn with_tool_loop_mode(&self, mode: ToolLoopMode) -> Self {
        Self {
            tool_loop_mode: Some(mode),
            ..self.clone()
        }
    }

    /// Concrete tracker configuration with defaults filled in.
    pub fn tool_loop_config(&self) -> ToolCallLoopConfig {
        ToolCallLoopConfig {
            enabled: self.tool_loop_detection_enabled,
            max_repeats: self.tool_loop_max_repeats.unwrap_or(4),
            ttl_seconds: self.tool_loop_ttl_seconds.unwrap_or(120),
            mode: self.tool_loop_mode.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_do_not_mutate_original() {
        let base = LoopDetectionConfiguration::default();
        let updated = base.with_loop_detection_enabled(false);
        assert!(base.loop_detection_enabled);
        assert!(!updated.loop_detection_enabled);
    }

    #[test]
    fn test_invalid_max_repeats_rejected() {
        let base = LoopDetectionConfiguration::default();
        assert!(base.with_tool_loop_max_repeats(1).is_err());
        assert!(base.with_tool_loop_max_repeats(2).is_ok());
    }

    #[test]
    fn test_invalid_ttl_rejected() {
        let base = LoopDetectionConfiguration::default();
        assert!(base.with_tool_loop_ttl_seconds(0).is_err());
    }

    #[test]
    fn test_tool_loop_config_defaults() {
        let config = LoopDetectionConfiguration::default().tool_loop_config();
        assert_eq!(config.max_repeats, 4);
        assert_eq!(config.ttl_seconds, 120);
        assert_eq!(config.mode, ToolLoopMode::Break);
    }

    #[test]
    fn test_overrides_flow_through() {
        let config = LoopDetectionConfiguration::default()
            .with_tool_loop_max_repeats(6)
            .unwrap()
            .with_tool_loop_mode(ToolLoopMode::ChanceThenBreak)
            .tool_loop_config();
        assert_eq!(config.max_repeats, 6);
        assert_eq!(config.mode, ToolLoopMode::ChanceThenBreak);
    }
}
