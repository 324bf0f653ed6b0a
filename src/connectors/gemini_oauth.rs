//! Gemini OAuth personal connector.
//!
//! Speaks the Code Assist API (`cloudcode-pa.googleapis.com`) with tokens
//! from gemini-cli's `~/.gemini/oauth_creds.json`. Project discovery calls
//! `:loadCodeAssist` and, when the account has no project, onboards to the
//! free tier. Free-tier onboarding MUST omit the `cloudaicompanionProject`
//! field entirely; including it (even as null) yields Precondition Failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chat_protocol::gemini::{Content, GenerateContentRequest, GenerationConfig, Part};
use chat_protocol::{ChatCompletionRequest, Role};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::openai::{convert_headers, map_transport_error};
use super::{
    translate_error_response, BackendConnector, BackendResponse, ConnectorCapabilities,
    OAuthFileStore, ResponseEnvelope, StreamingResponseEnvelope,
};
use crate::error::ProxyError;
use crate::streaming::RawChunk;

const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const QUOTA_EXHAUSTED_MARKER: &str = "Quota exceeded for quota metric";

const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const EXPIRY_BUFFER_SECONDS: i64 = 60;
const ONBOARD_MAX_ATTEMPTS: u32 = 30;
const ONBOARD_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct GeminiOAuthPersonalConnector {
    client: reqwest::Client,
    api_base: String,
    store: OAuthFileStore,
    refresh_lock: Mutex<()>,
    project_id: RwLock<Option<String>>,
    /// Set when the upstream reports quota exhaustion; the connector is
    /// unusable until restart.
    unusable: AtomicBool,
    oauth_client_id: Option<String>,
    oauth_client_secret: Option<String>,
}

impl GeminiOAuthPersonalConnector {
    pub fn new(store: OAuthFileStore) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::internal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: CODE_ASSIST_ENDPOINT.to_string(),
            store,
            refresh_lock: Mutex::new(()),
            project_id: RwLock::new(None),
            unusable: AtomicBool::new(false),
            oauth_client_id: std::env::var("GEMINI_OAUTH_CLIENT_ID").ok(),
            oauth_client_secret: std::env::var("GEMINI_OAUTH_CLIENT_SECRET").ok(),
        })
    }

    async fn access_token(&self) -> Result<String, ProxyError> {
        let credentials = self.store.load()?;
        if !credentials.is_expired(EXPIRY_BUFFER_SECONDS) {
            return Ok(credentials.access_token);
        }

        // One refresh at a time; late arrivals use the winner's token.
        let _guard = self.refresh_lock.lock().await;
        let credentials = self.store.load()?;
        if !credentials.is_expired(EXPIRY_BUFFER_SECONDS) {
            return Ok(credentials.access_token);
        }

        let Some(refresh_token) = credentials.refresh_token.clone() else {
            return Err(ProxyError::Authentication {
                message: "Gemini OAuth token expired and no refresh_token present".to_string(),
            });
        };
        let (Some(client_id), Some(client_secret)) =
            (&self.oauth_client_id, &self.oauth_client_secret)
        else {
            warn!("token expired but no OAuth client configured, run `gemini auth` to refresh");
            return Err(ProxyError::Authentication {
                message: "Gemini OAuth token expired; refresh with gemini-cli or configure \
                          GEMINI_OAUTH_CLIENT_ID / GEMINI_OAUTH_CLIENT_SECRET"
                    .to_string(),
            });
        };

        info!("refreshing Gemini OAuth access token");
        let response = self
            .client
            .post(GOOGLE_TOKEN_ENDPOINT)
            .timeout(REFRESH_TIMEOUT)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("token refresh rejected: {text}");
            return Err(ProxyError::Authentication {
                message: format!("Gemini OAuth token refresh failed: {text}"),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProxyError::Authentication {
                message: format!("malformed token refresh response: {e}"),
            })?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::Authentication {
                message: "token refresh response missing access_token".to_string(),
            })?
            .to_string();
        let expires_in = body.get("expires_in").and_then(Value::as_i64).unwrap_or(3600);

        let refreshed = super::OAuthCredentials {
            access_token: access_token.clone(),
            refresh_token: Some(refresh_token),
            token_type: body
                .get("token_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            expiry_date: Some(chrono::Utc::now().timestamp_millis() + expires_in * 1000),
        };
        self.store.save(&refreshed)?;
        Ok(access_token)
    }

    /// Discover (or onboard) the Cloud AI Companion project backing this
    /// account.
    async fn ensure_project(&self, token: &str) -> Result<String, ProxyError> {
        if let Some(project) = self.project_id.read().await.clone() {
            return Ok(project);
        }

        let load_url = format!("{}/v1internal:loadCodeAssist", self.api_base);
        let load_response = self
            .client
            .post(&load_url)
            .bearer_auth(token)
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({ "metadata": client_metadata() }))
            .send()
            .await
            .map_err(map_transport_error)?;

        if !load_response.status().is_success() {
            let text = load_response.text().await.unwrap_or_default();
            return Err(ProxyError::backend(format!("loadCodeAssist failed: {text}")));
        }
        let load_data: Value = load_response
            .json()
            .await
            .map_err(|e| ProxyError::backend(format!("malformed loadCodeAssist response: {e}")))?;

        if let Some(project) = load_data
            .get("cloudaicompanionProject")
            .and_then(Value::as_str)
        {
            let project = project.to_string();
            info!(project, "existing Code Assist project discovered");
            *self.project_id.write().await = Some(project.clone());
            return Ok(project);
        }

        // No project yet: onboard. The default tier may require a
        // user-defined GCP project we do not have, so fall back to free-tier
        // unconditionally in that case.
        let default_tier = load_data
            .get("allowedTiers")
            .and_then(Value::as_array)
            .and_then(|tiers| {
                tiers
                    .iter()
                    .find(|t| t.get("isDefault").and_then(Value::as_bool) == Some(true))
            });
        let tier_id = match default_tier {
            Some(tier)
                if tier
                    .get("userDefinedCloudaicompanionProject")
                    .and_then(Value::as_bool)
                    != Some(true) =>
            {
                tier.get("id").and_then(Value::as_str).unwrap_or("free-tier")
            }
            _ => "free-tier",
        };
        info!(tier_id, "onboarding user");

        // Free tier: the cloudaicompanionProject field must be completely
        // absent from the request.
        let onboard_request = if tier_id == "free-tier" {
            json!({ "tierId": tier_id, "metadata": client_metadata() })
        } else {
            json!({
                "tierId": tier_id,
                "cloudaicompanionProject": load_data.get("cloudaicompanionProject"),
                "metadata": client_metadata(),
            })
        };

        let onboard_url = format!("{}/v1internal:onboardUser", self.api_base);
        let mut operation = self
            .post_json(&onboard_url, token, &onboard_request)
            .await?;

        let mut attempts = 0;
        while operation.get("done").and_then(Value::as_bool) != Some(true) {
            if attempts >= ONBOARD_MAX_ATTEMPTS {
                return Err(ProxyError::backend(
                    "onboarding timeout - operation did not complete",
                ));
            }
            tokio::time::sleep(ONBOARD_POLL_INTERVAL).await;
            operation = self.post_json(&onboard_url, token, &onboard_request).await?;
            attempts += 1;
        }

        let project = operation
            .get("response")
            .and_then(|r| r.get("cloudaicompanionProject"))
            .and_then(|p| p.get("id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if project.is_empty() {
            return Err(ProxyError::backend(
                "onboarding completed without a project id",
            ));
        }
        info!(project, "onboarded to Code Assist");
        *self.project_id.write().await = Some(project.clone());
        Ok(project)
    }

    async fn post_json(
        &self,
        url: &str,
        token: &str,
        body: &Value,
    ) -> Result<Value, ProxyError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .timeout(REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProxyError::backend(format!("{url} failed: {text}")));
        }
        response
            .json()
            .await
            .map_err(|e| ProxyError::backend(format!("malformed response from {url}: {e}")))
    }

    fn check_quota_exhaustion(&self, status: reqwest::StatusCode, body: &str) -> Option<ProxyError> {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS && body.contains(QUOTA_EXHAUSTED_MARKER)
        {
            error!("Gemini quota exhausted, marking connector unusable until restart");
            self.unusable.store(true, Ordering::SeqCst);
            return Some(ProxyError::QuotaExhausted {
                message: "Gemini free-tier quota exhausted".to_string(),
                backend: self.name().to_string(),
            });
        }
        None
    }
}

#[async_trait]
impl BackendConnector for GeminiOAuthPersonalConnector {
    fn name(&self) -> &'static str {
        "gemini-cli-oauth-personal"
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_oauth: true,
            supports_streaming: true,
        }
    }

    async fn initialize(&self) -> Result<(), ProxyError> {
        let token = self.access_token().await?;
        self.ensure_project(&token).await.map(|_| ())
    }

    async fn list_models(&self) -> Result<Vec<String>, ProxyError> {
        // The Code Assist API has no model listing; these are the models the
        // personal tier serves.
        Ok(vec![
            "gemini-2.5-pro".to_string(),
            "gemini-2.5-flash".to_string(),
        ])
    }

    async fn chat_completions(
        &self,
        request: &ChatCompletionRequest,
        effective_model: &str,
    ) -> Result<BackendResponse, ProxyError> {
        if self.unusable.load(Ordering::SeqCst) {
            return Err(ProxyError::ServiceUnavailable {
                message: "Gemini connector disabled after quota exhaustion, restart to retry"
                    .to_string(),
            });
        }

        let token = self.access_token().await?;
        let project = self.ensure_project(&token).await?;

        let wrapped = json!({
            "model": effective_model,
            "project": project,
            "request": to_gemini_request(request),
        });

        let action = if request.stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let mut url = format!("{}/v1internal:{}", self.api_base, action);
        if request.stream {
            url.push_str("?alt=sse");
        }

        let mut builder = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&wrapped);
        if !request.stream {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let headers = convert_headers(response.headers());

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if let Some(quota) = self.check_quota_exhaustion(status, &text) {
                return Err(quota);
            }
            let status = axum::http::StatusCode::from_u16(status.as_u16())
                .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
            return Err(translate_error_response(self.name(), status, &headers, &text));
        }

        if request.stream {
            let model = effective_model.to_string();
            let stream = super::sse_frames(response.bytes_stream().boxed())
                .map(move |raw| project_stream_frame(raw, &model))
                .boxed();
            return Ok(BackendResponse::Streaming(StreamingResponseEnvelope {
                stream,
                media_type: "text/event-stream".to_string(),
                headers,
            }));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProxyError::backend(format!("invalid upstream JSON: {e}")))?;
        let content = gemini_to_openai_body(&body, effective_model);
        Ok(BackendResponse::Buffered(ResponseEnvelope {
            content,
            headers,
            status: axum::http::StatusCode::OK,
        }))
    }
}

fn client_metadata() -> Value {
    json!({
        "ideType": "IDE_UNSPECIFIED",
        "platform": "PLATFORM_UNSPECIFIED",
        "pluginType": "GEMINI",
    })
}

/// Project the canonical chat request into a Gemini `generateContent` body.
fn to_gemini_request(request: &ChatCompletionRequest) -> GenerateContentRequest {
    let mut contents = Vec::new();
    let mut system_parts = Vec::new();

    for message in &request.messages {
        let text = message.content.clone().unwrap_or_default();
        match message.role {
            Role::System => system_parts.push(Part {
                text: Some(text),
                ..Default::default()
            }),
            Role::Assistant => contents.push(Content {
                role: Some("model".to_string()),
                parts: vec![Part {
                    text: Some(text),
                    ..Default::default()
                }],
            }),
            _ => contents.push(Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(text),
                    ..Default::default()
                }],
            }),
        }
    }

    GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then_some(Content {
            role: None,
            parts: system_parts,
        }),
        generation_config: Some(GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: request.max_tokens,
            stop_sequences: request.stop.as_ref().map(|s| match s {
                chat_protocol::common::StringOrArray::String(one) => vec![one.clone()],
                chat_protocol::common::StringOrArray::Array(many) => many.clone(),
            }),
            response_mime_type: None,
            response_schema: None,
        }),
        other: Default::default(),
    }
}

/// Project one Gemini SSE frame into the OpenAI chunk shape the pipeline
/// expects. Frames that do not parse pass through as raw bytes.
fn project_stream_frame(raw: RawChunk, model: &str) -> RawChunk {
    let RawChunk::Bytes(bytes) = raw else {
        return raw;
    };
    let Ok(text) = std::str::from_utf8(&bytes) else {
        return RawChunk::Bytes(bytes);
    };
    let payload = text.trim().strip_prefix("data: ").unwrap_or(text.trim());
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return RawChunk::Bytes(bytes);
    };
    RawChunk::Value(gemini_to_openai_chunk(&value, model))
}

fn candidate_text(body: &Value) -> String {
    let response = body.get("response").unwrap_or(body);
    response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn gemini_to_openai_chunk(body: &Value, model: &str) -> Value {
    let response = body.get("response").unwrap_or(body);
    json!({
        "model": model,
        "choices": [{"delta": {"content": candidate_text(body)}}],
        "usage": response.get("usageMetadata"),
    })
}

fn gemini_to_openai_body(body: &Value, model: &str) -> Value {
    let response = body.get("response").unwrap_or(body);
    json!({
        "id": chat_protocol::generate_id("chatcmpl-"),
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": candidate_text(body)},
            "finish_reason": response
                .get("candidates")
                .and_then(Value::as_array)
                .and_then(|c| c.first())
                .and_then(|c| c.get("finishReason"))
                .cloned()
                .unwrap_or(Value::Null),
        }],
        "usage": response.get("usageMetadata"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_protocol::ChatMessage;

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        serde_json::from_value(json!({ "model": "gemini-2.5-pro", "messages": messages }))
            .unwrap()
    }

    #[test]
    fn test_system_messages_become_system_instruction() {
        let req = request(vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi"),
        ]);
        let gemini = to_gemini_request(&req);
        assert_eq!(gemini.contents.len(), 2);
        assert_eq!(gemini.contents[0].role.as_deref(), Some("user"));
        assert_eq!(gemini.contents[1].role.as_deref(), Some("model"));
        assert_eq!(
            gemini.system_instruction.unwrap().flattened_text(),
            "be brief"
        );
    }

    #[test]
    fn test_candidate_text_unwraps_response_envelope() {
        let body = json!({
            "response": {
                "candidates": [{"content": {"parts": [{"text": "Hel"}, {"text": "lo"}]}}]
            }
        });
        assert_eq!(candidate_text(&body), "Hello");
    }

    #[test]
    fn test_stream_frame_projection() {
        let frame = RawChunk::Bytes(bytes::Bytes::from_static(
            br#"data: {"candidates": [{"content": {"parts": [{"text": "x"}]}}]}"#,
        ));
        match project_stream_frame(frame, "gemini-2.5-pro") {
            RawChunk::Value(v) => {
                assert_eq!(v["choices"][0]["delta"]["content"], "x");
                assert_eq!(v["model"], "gemini-2.5-pro");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
