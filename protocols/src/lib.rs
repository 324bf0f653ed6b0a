//! Wire types shared by the proxy's ingress dialects and its backends.
//!
//! The OpenAI chat-completion shape is the canonical interchange format:
//! Anthropic and Gemini requests are projected into it on ingress and out of
//! it on egress. Everything that flows through the response pipeline speaks
//! the types in [`chat`] and [`common`].

pub mod anthropic;
pub mod chat;
pub mod common;
pub mod gemini;

pub use chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatCompletionStreamResponse, ChatChoice,
    ChatMessage, Delta, StreamChoice,
};
pub use common::{FinishReason, Function, FunctionCall, Role, Tool, ToolCall, Usage};

use rand::distr::Alphanumeric;
use rand::Rng;

/// Generate a wire-format identifier such as `chatcmpl-8f3k…` or `call_b2c9…`.
pub fn generate_id(prefix: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_prefix_and_length() {
        let id = generate_id("chatcmpl-");
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(id.len(), "chatcmpl-".len() + 24);
    }
}
