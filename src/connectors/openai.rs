//! OpenAI-compatible API-key connector. The default backend: plain bearer
//! auth, JSON in, JSON or SSE out.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use chat_protocol::ChatCompletionRequest;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::debug;

use super::{
    sse_frames, translate_error_response, BackendConnector, BackendResponse,
    ConnectorCapabilities, ResponseEnvelope, StreamingResponseEnvelope,
};
use crate::error::ProxyError;

/// Per-call timeout for buffered requests; streams get an initial-connect
/// timeout only.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct OpenAIConnector {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl OpenAIConnector {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::internal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn execute(
        &self,
        request: &ChatCompletionRequest,
        effective_model: &str,
        bearer_override: Option<&str>,
    ) -> Result<BackendResponse, ProxyError> {
        let mut body = request.clone();
        body.model = effective_model.to_string();

        let url = format!("{}/chat/completions", self.api_base);
        let mut builder = self.client.post(&url).json(&body);
        builder = match bearer_override {
            Some(token) => builder.bearer_auth(token),
            None => self.authorize(builder),
        };
        if !body.stream {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let headers = convert_headers(response.headers());

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(translate_error_response(self.name(), status, &headers, &text));
        }

        if body.stream {
            debug!(model = effective_model, "opened upstream stream");
            let stream = sse_frames(response.bytes_stream().boxed());
            return Ok(BackendResponse::Streaming(StreamingResponseEnvelope {
                stream,
                media_type: "text/event-stream".to_string(),
                headers,
            }));
        }

        let content: Value = response
            .json()
            .await
            .map_err(|e| ProxyError::backend(format!("invalid upstream JSON: {e}")))?;
        Ok(BackendResponse::Buffered(ResponseEnvelope {
            content,
            headers,
            status,
        }))
    }

    async fn fetch_models(&self, bearer_override: Option<&str>) -> Result<Vec<String>, ProxyError> {
        let url = format!("{}/models", self.api_base);
        let mut builder = self.client.get(&url).timeout(REQUEST_TIMEOUT);
        builder = match bearer_override {
            Some(token) => builder.bearer_auth(token),
            None => self.authorize(builder),
        };

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        if !status.is_success() {
            let headers = convert_headers(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(translate_error_response(self.name(), status, &headers, &text));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProxyError::backend(format!("invalid models listing: {e}")))?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl BackendConnector for OpenAIConnector {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_oauth: false,
            supports_streaming: true,
        }
    }

    async fn initialize(&self) -> Result<(), ProxyError> {
        if self.api_key.is_none() {
            return Err(ProxyError::Configuration {
                message: "openai backend requires OPENAI_API_KEY".to_string(),
            });
        }
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>, ProxyError> {
        self.fetch_models(None).await
    }

    async fn chat_completions(
        &self,
        request: &ChatCompletionRequest,
        effective_model: &str,
    ) -> Result<BackendResponse, ProxyError> {
        self.execute(request, effective_model, None).await
    }
}

pub(crate) fn map_transport_error(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        return ProxyError::backend(format!("upstream timeout: {e}"));
    }
    if e.is_connect() {
        return ProxyError::ServiceUnavailable {
            message: format!("cannot reach upstream: {e}"),
        };
    }
    ProxyError::backend(format!("upstream transport error: {e}"))
}

pub(crate) fn convert_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

// `execute` and `fetch_models` take a bearer override so the OAuth connector
// can reuse the exact same wire path with a refreshed token.
impl OpenAIConnector {
    pub(crate) async fn chat_completions_with_token(
        &self,
        request: &ChatCompletionRequest,
        effective_model: &str,
        token: &str,
    ) -> Result<BackendResponse, ProxyError> {
        self.execute(request, effective_model, Some(token)).await
    }

    pub(crate) async fn list_models_with_token(
        &self,
        token: &str,
    ) -> Result<Vec<String>, ProxyError> {
        self.fetch_models(Some(token)).await
    }
}
