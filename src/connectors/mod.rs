//! Backend connectors: the narrow contract the core consumes, plus the
//! concrete OpenAI-compatible and OAuth connectors.

mod gemini_oauth;
mod oauth;
mod openai;
mod openai_oauth;
mod sse;

pub use gemini_oauth::GeminiOAuthPersonalConnector;
pub use oauth::{CredentialFormat, OAuthCredentials, OAuthFileStore};
pub use openai::OpenAIConnector;
pub use openai_oauth::OpenAIOAuthConnector;
pub use sse::sse_frames;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use chat_protocol::ChatCompletionRequest;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::ProxyError;
use crate::streaming::RawChunk;

/// Capability table replacing virtual dispatch where useful.
#[derive(Debug, Clone, Copy)]
pub struct ConnectorCapabilities {
    pub supports_oauth: bool,
    pub supports_streaming: bool,
}

/// A complete upstream response.
pub struct ResponseEnvelope {
    pub content: Value,
    pub headers: HeaderMap,
    pub status: StatusCode,
}

/// An in-flight upstream stream.
pub struct StreamingResponseEnvelope {
    pub stream: BoxStream<'static, RawChunk>,
    pub media_type: String,
    pub headers: HeaderMap,
}

pub enum BackendResponse {
    Buffered(ResponseEnvelope),
    Streaming(StreamingResponseEnvelope),
}

/// The contract every backend connector provides to the core.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> ConnectorCapabilities;

    async fn initialize(&self) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>, ProxyError>;

    async fn chat_completions(
        &self,
        request: &ChatCompletionRequest,
        effective_model: &str,
    ) -> Result<BackendResponse, ProxyError>;
}

/// Registry of connectors plus `backend:model` prefix routing.
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn BackendConnector>>,
    default_backend: String,
}

impl ConnectorRegistry {
    pub fn new(default_backend: impl Into<String>) -> Self {
        Self {
            connectors: HashMap::new(),
            default_backend: default_backend.into(),
        }
    }

    pub fn register(&mut self, connector: Arc<dyn BackendConnector>) {
        self.connectors
            .insert(connector.name().to_string(), connector);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BackendConnector>, ProxyError> {
        self.connectors.get(name).cloned().ok_or_else(|| {
            ProxyError::Configuration {
                message: format!("no backend registered under '{name}'"),
            }
        })
    }

    pub fn backends(&self) -> impl Iterator<Item = (&String, &Arc<dyn BackendConnector>)> {
        self.connectors.iter()
    }

    /// Resolve a requested model to a connector and the effective upstream
    /// model name, stripping a recognized `backend:` prefix.
    pub fn resolve(
        &self,
        requested_model: &str,
    ) -> Result<(Arc<dyn BackendConnector>, String), ProxyError> {
        if let Some((prefix, rest)) = requested_model.split_once(':') {
            if let Some(connector) = self.connectors.get(prefix) {
                return Ok((connector.clone(), rest.to_string()));
            }
        }
        Ok((
            self.get(&self.default_backend)?,
            requested_model.to_string(),
        ))
    }
}

/// Translate an upstream error response into the core's error shape.
/// 429 carries the `Retry-After` seconds count when available.
pub fn translate_error_response(
    backend: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> ProxyError {
    let backend_response: Option<Value> = serde_json::from_str(body).ok();
    let message = backend_response
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(500).collect());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProxyError::Authentication {
            message: format!("{backend} rejected credentials: {message}"),
        },
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = headers
                .get(axum::http::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            ProxyError::RateLimitExceeded {
                message,
                retry_after,
            }
        }
        _ => ProxyError::Backend {
            message,
            backend: Some(backend.to_string()),
            backend_status: Some(status.as_u16()),
            backend_response,
        },
    }
}
