//! Interactive LLM proxy gateway.
//!
//! Accepts OpenAI-, Anthropic- and Gemini-shaped chat-completion requests,
//! routes them to a selectable set of upstream backends, and runs every
//! response (streaming or buffered) through a pipeline of content
//! processors: tool-call repair, JSON repair, loop detection, content
//! accumulation and the response middleware chain.

pub mod config;
pub mod connectors;
pub mod error;
pub mod middleware;
pub mod processor;
pub mod server;
pub mod session;
pub mod streaming;
pub mod tool_loop;
pub mod translation;

pub use config::AppConfig;
pub use error::ProxyError;
