//! Gateway error taxonomy and HTTP mapping.
//!
//! Every failure that can cross a component boundary is a [`ProxyError`].
//! Chat-completion paths render errors as OpenAI-shaped bodies (an assistant
//! message carrying the error text with `finish_reason: "error"` plus a
//! sibling `error` object) so existing clients keep working.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        /// Seconds the client should wait, from the upstream `Retry-After`.
        retry_after: Option<u64>,
    },

    #[error("backend error: {message}")]
    Backend {
        message: String,
        backend: Option<String>,
        backend_status: Option<u16>,
        backend_response: Option<Value>,
    },

    #[error("quota exhausted: {message}")]
    QuotaExhausted { message: String, backend: String },

    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("loop detected: pattern '{pattern}' repeated {repetitions} times")]
    LoopDetected {
        pattern: String,
        repetitions: usize,
    },

    #[error("tool call loop detected: {reason}")]
    ToolCallLoopDetected {
        reason: String,
        tool_name: String,
        repetitions: usize,
    },

    #[error("parsing error: {message}")]
    Parsing { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Control signal, not a terminal failure: the empty-response middleware
    /// asks the request processor to retry with a recovery prompt. It only
    /// reaches the HTTP layer if the processor fails to consume it.
    #[error("empty response, retry {retry_count} requested")]
    EmptyResponseRetry {
        recovery_prompt: String,
        retry_count: u32,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ProxyError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            backend: None,
            backend_status: None,
            backend_response: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::Parsing {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Backend { .. } | Self::QuotaExhausted { .. } => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Validation { .. }
            | Self::LoopDetected { .. }
            | Self::ToolCallLoopDetected { .. }
            | Self::Parsing { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. }
            | Self::EmptyResponseRetry { .. }
            | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "authentication_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Backend { .. } => "backend_error",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Validation { .. } => "validation_error",
            Self::LoopDetected { .. } => "loop_detected",
            Self::ToolCallLoopDetected { .. } => "tool_call_loop_detected",
            Self::Parsing { .. } => "parsing_error",
            Self::Configuration { .. } => "configuration_error",
            Self::EmptyResponseRetry { .. } | Self::Internal { .. } => "internal_error",
        }
    }

    /// Structured details for the `error.details` field.
    pub fn details(&self) -> Value {
        match self {
            Self::Backend {
                backend,
                backend_status,
                backend_response,
                ..
            } => {
                let mut details = serde_json::Map::new();
                if let Some(backend) = backend {
                    details.insert("backend".into(), json!(backend));
                }
                if let Some(status) = backend_status {
                    details.insert("backend_status".into(), json!(status));
                }
                if let Some(response) = backend_response {
                    details.insert("backend_response".into(), response.clone());
                }
                Value::Object(details)
            }
            Self::LoopDetected {
                pattern,
                repetitions,
            } => {
                let excerpt: String = pattern.chars().take(100).collect();
                json!({ "pattern": excerpt, "repetitions": repetitions })
            }
            Self::ToolCallLoopDetected {
                tool_name,
                repetitions,
                ..
            } => json!({ "tool_name": tool_name, "repetitions": repetitions }),
            Self::RateLimitExceeded { retry_after, .. } => match retry_after {
                Some(seconds) => json!({ "retry_after": seconds }),
                None => json!({}),
            },
            _ => json!({}),
        }
    }

    /// OpenAI-shaped error body for chat-completion paths.
    pub fn to_openai_body(&self) -> Value {
        json!({
            "id": chat_protocol::generate_id("chatcmpl-"),
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": self.to_string() },
                "finish_reason": "error"
            }],
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "details": self.details()
            }
        })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, Json(self.to_openai_body())).into_response();

        if let Self::RateLimitExceeded {
            retry_after: Some(seconds),
            ..
        } = &self
        {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
