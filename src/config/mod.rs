//! Gateway configuration: CLI flags, environment variables and the derived
//! per-session loop settings.

mod r#loop;

pub use r#loop::LoopDetectionConfiguration;

use clap::Parser;

use crate::tool_loop::ToolLoopMode;

#[derive(Debug, Clone, Parser)]
#[command(name = "lpg", about = "Interactive LLM proxy gateway")]
pub struct AppConfig {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "LPG_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "LPG_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Backend used when the model carries no `backend:` prefix.
    #[arg(long, env = "LPG_DEFAULT_BACKEND", default_value = "openai")]
    pub default_backend: String,

    /// Base URL for the OpenAI-compatible backend.
    #[arg(
        long,
        env = "LPG_OPENAI_API_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    pub openai_api_base: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, env = "LPG_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    #[arg(long, env = "LPG_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Disable content loop detection entirely.
    #[arg(long, env = "LPG_DISABLE_LOOP_DETECTION", default_value_t = false)]
    pub disable_loop_detection: bool,

    /// Disable tool-call loop detection.
    #[arg(long, env = "LPG_DISABLE_TOOL_LOOP_DETECTION", default_value_t = false)]
    pub disable_tool_loop_detection: bool,

    #[arg(long, env = "LPG_TOOL_LOOP_MAX_REPEATS", default_value_t = 4)]
    pub tool_loop_max_repeats: u32,

    #[arg(long, env = "LPG_TOOL_LOOP_TTL_SECONDS", default_value_t = 120)]
    pub tool_loop_ttl_seconds: u64,

    /// `break` or `chance_then_break` (shorthand: `chance`).
    #[arg(long, env = "LPG_TOOL_LOOP_MODE", default_value = "break")]
    pub tool_loop_mode: String,

    /// Soft cap for the streaming JSON repair buffer, in bytes.
    #[arg(long, env = "LPG_JSON_REPAIR_BUFFER_CAP", default_value_t = 4096)]
    pub json_repair_buffer_cap: usize,

    /// Cap for per-stream content accumulation, in bytes.
    #[arg(
        long,
        env = "LPG_CONTENT_BUFFER_MAX_BYTES",
        default_value_t = 10 * 1024 * 1024
    )]
    pub content_buffer_max_bytes: usize,

    /// Automatic retries for empty responses before surfacing an error.
    #[arg(long, env = "LPG_EMPTY_RESPONSE_MAX_RETRIES", default_value_t = 1)]
    pub empty_response_max_retries: u32,
}

impl AppConfig {
    /// Defaults suitable for tests and embedding.
    pub fn for_tests() -> Self {
        Self::parse_from(["lpg"])
    }

    /// The session-level loop configuration derived from the CLI flags.
    pub fn loop_config(&self) -> LoopDetectionConfiguration {
        let mode: ToolLoopMode = self.tool_loop_mode.parse().unwrap_or_default();
        let base = LoopDetectionConfiguration::default()
            .with_loop_detection_enabled(!self.disable_loop_detection)
            .with_tool_loop_detection_enabled(!self.disable_tool_loop_detection)
            .with_tool_loop_mode(mode);
        let base = base
            .with_tool_loop_max_repeats(self.tool_loop_max_repeats)
            .unwrap_or(base);
        base.clone()
            .with_tool_loop_ttl_seconds(self.tool_loop_ttl_seconds)
            .unwrap_or(base)
    }
}
