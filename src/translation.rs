//! Dialect translation at the ingress boundary.
//!
//! The core processes only the canonical (OpenAI-shaped) chat request;
//! Anthropic and Gemini bodies are projected through this narrow interface.
//! Unknown fields ride along in the request's `other` map.

use chat_protocol::anthropic::{ContentBlock, CreateMessageRequest, SystemContent};
use chat_protocol::gemini::GenerateContentRequest;
use chat_protocol::{ChatCompletionRequest, ChatMessage};
use serde_json::{json, Value};

use crate::error::ProxyError;
use crate::processor::ProcessedResponse;

pub trait TranslationService: Send + Sync {
    fn anthropic_to_canonical(&self, body: Value) -> Result<ChatCompletionRequest, ProxyError>;

    fn canonical_to_anthropic(&self, response: &ProcessedResponse, model: &str) -> Value;

    fn gemini_to_canonical(
        &self,
        model: &str,
        body: Value,
        stream: bool,
    ) -> Result<ChatCompletionRequest, ProxyError>;

    fn canonical_to_gemini(&self, response: &ProcessedResponse, model: &str) -> Value;
}

/// The built-in pure-function translation.
pub struct DialectTranslation;

impl TranslationService for DialectTranslation {
    fn anthropic_to_canonical(&self, body: Value) -> Result<ChatCompletionRequest, ProxyError> {
        let request: CreateMessageRequest = serde_json::from_value(body)
            .map_err(|e| ProxyError::validation(format!("invalid Anthropic request: {e}")))?;

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            let text = match system {
                SystemContent::Text(text) => text.clone(),
                SystemContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(""),
            };
            if !text.is_empty() {
                messages.push(ChatMessage::system(text));
            }
        }
        for message in &request.messages {
            let text = message.content.flattened_text();
            match message.role.as_str() {
                "assistant" => messages.push(ChatMessage::assistant(text)),
                _ => messages.push(ChatMessage::user(text)),
            }
        }

        Ok(serde_json::from_value(json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "top_p": request.top_p,
            "stream": request.stream.unwrap_or(false),
            "stop": request.stop_sequences,
        }))
        .map_err(|e| ProxyError::internal(format!("canonical projection failed: {e}")))?)
    }

    fn canonical_to_anthropic(&self, response: &ProcessedResponse, model: &str) -> Value {
        let mut content = Vec::new();
        if !response.content.is_empty() {
            content.push(json!({"type": "text", "text": response.content}));
        }
        for call in response.tool_calls() {
            content.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.function.name,
                "input": serde_json::from_str::<Value>(&call.function.arguments)
                    .unwrap_or(Value::Null),
            }));
        }

        json!({
            "id": chat_protocol::generate_id("msg_"),
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": content,
            "stop_reason": "end_turn",
            "usage": response.usage,
        })
    }

    fn gemini_to_canonical(
        &self,
        model: &str,
        body: Value,
        stream: bool,
    ) -> Result<ChatCompletionRequest, ProxyError> {
        let request: GenerateContentRequest = serde_json::from_value(body)
            .map_err(|e| ProxyError::validation(format!("invalid Gemini request: {e}")))?;

        let mut messages = Vec::new();
        if let Some(system) = &request.system_instruction {
            let text = system.flattened_text();
            if !text.is_empty() {
                messages.push(ChatMessage::system(text));
            }
        }
        for content in &request.contents {
            let text = content.flattened_text();
            match content.role.as_deref() {
                Some("model") => messages.push(ChatMessage::assistant(text)),
                _ => messages.push(ChatMessage::user(text)),
            }
        }

        let config = request.generation_config.unwrap_or_default();
        let response_format = match (&config.response_mime_type, &config.response_schema) {
            (_, Some(schema)) => Some(json!({
                "type": "json_schema",
                "json_schema": {"name": "response", "schema": schema}
            })),
            (Some(mime), None) if mime.contains("application/json") => {
                Some(json!({"type": "json_object"}))
            }
            _ => None,
        };

        Ok(serde_json::from_value(json!({
            "model": model,
            "messages": messages,
            "max_tokens": config.max_output_tokens,
            "temperature": config.temperature,
            "top_p": config.top_p,
            "stop": config.stop_sequences,
            "stream": stream,
            "response_format": response_format,
        }))
        .map_err(|e| ProxyError::internal(format!("canonical projection failed: {e}")))?)
    }

    fn canonical_to_gemini(&self, response: &ProcessedResponse, model: &str) -> Value {
        json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"text": response.content}],
                },
                "finishReason": "STOP",
                "index": 0,
            }],
            "modelVersion": model,
            "usageMetadata": response.usage,
        })
    }
}
