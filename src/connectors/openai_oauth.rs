//! OpenAI OAuth connector: reuses the OpenAI wire path with tokens from the
//! Codex CLI's `~/.codex/auth.json`.
//!
//! The Codex CLI owns the refresh lifecycle; this connector reloads the file
//! when the cached token goes stale and serializes refresh attempts across
//! concurrent callers so they share one reload rather than stampeding.

use async_trait::async_trait;
use chat_protocol::ChatCompletionRequest;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::openai::OpenAIConnector;
use super::{
    BackendConnector, BackendResponse, ConnectorCapabilities, OAuthFileStore,
};
use crate::error::ProxyError;

/// Refresh this many seconds before the recorded expiry.
const EXPIRY_BUFFER_SECONDS: i64 = 60;

pub struct OpenAIOAuthConnector {
    inner: OpenAIConnector,
    store: OAuthFileStore,
    refresh_lock: Mutex<()>,
}

impl OpenAIOAuthConnector {
    pub fn new(api_base: impl Into<String>, store: OAuthFileStore) -> Result<Self, ProxyError> {
        Ok(Self {
            inner: OpenAIConnector::new(api_base, None)?,
            store,
            refresh_lock: Mutex::new(()),
        })
    }

    /// Current access token, reloading the credential file when stale.
    async fn access_token(&self) -> Result<String, ProxyError> {
        let credentials = self.store.load()?;
        if !credentials.is_expired(EXPIRY_BUFFER_SECONDS) {
            return Ok(credentials.access_token);
        }

        // Serialize: concurrent requests share one reload.
        let _guard = self.refresh_lock.lock().await;
        let credentials = self.store.load()?;
        if !credentials.is_expired(EXPIRY_BUFFER_SECONDS) {
            info!("credentials were refreshed out-of-band, using reloaded token");
            return Ok(credentials.access_token);
        }

        warn!(
            path = %self.store.path().display(),
            "OAuth token expired and no refresher available, run `codex login`"
        );
        Err(ProxyError::Authentication {
            message: "OpenAI OAuth token expired; run `codex login` to refresh auth.json"
                .to_string(),
        })
    }
}

#[async_trait]
impl BackendConnector for OpenAIOAuthConnector {
    fn name(&self) -> &'static str {
        "openai-oauth"
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_oauth: true,
            supports_streaming: true,
        }
    }

    async fn initialize(&self) -> Result<(), ProxyError> {
        self.access_token().await.map(|_| ())
    }

    async fn list_models(&self) -> Result<Vec<String>, ProxyError> {
        let token = self.access_token().await?;
        self.inner.list_models_with_token(&token).await
    }

    async fn chat_completions(
        &self,
        request: &ChatCompletionRequest,
        effective_model: &str,
    ) -> Result<BackendResponse, ProxyError> {
        let token = self.access_token().await?;
        self.inner
            .chat_completions_with_token(request, effective_model, &token)
            .await
    }
}
