//! Request orchestration: backend dispatch, effective-model resolution and
//! the empty-response auto-retry loop.

use std::sync::Arc;

use bytes::Bytes;
use chat_protocol::{ChatCompletionRequest, ChatMessage};
use futures::stream::BoxStream;
use tracing::{debug, info};

use super::{ProcessedResponse, ResponseHints, ResponseProcessor};
use crate::connectors::{BackendResponse, ConnectorRegistry};
use crate::error::ProxyError;
use crate::session::SessionStore;

/// Sampling overrides applied for one request after an edit failure marker
/// was seen in the previous response.
const EDIT_PRECISION_TEMPERATURE: f32 = 0.1;
const EDIT_PRECISION_TOP_P: f32 = 0.3;

pub enum RequestOutcome {
    Buffered(ProcessedResponse),
    Streaming {
        stream: BoxStream<'static, Bytes>,
        media_type: String,
    },
}

impl std::fmt::Debug for RequestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(resp) => f.debug_tuple("Buffered").field(resp).finish(),
            Self::Streaming { media_type, .. } => f
                .debug_struct("Streaming")
                .field("media_type", media_type)
                .finish_non_exhaustive(),
        }
    }
}

pub struct RequestProcessor {
    connectors: Arc<ConnectorRegistry>,
    responses: Arc<ResponseProcessor>,
    sessions: Arc<SessionStore>,
    max_empty_retries: u32,
}

impl RequestProcessor {
    pub fn new(
        connectors: Arc<ConnectorRegistry>,
        responses: Arc<ResponseProcessor>,
        sessions: Arc<SessionStore>,
        max_empty_retries: u32,
    ) -> Self {
        Self {
            connectors,
            responses,
            sessions,
            max_empty_retries,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Dispatch one chat request and run the response pipeline over the
    /// result. Empty responses are retried with a recovery prompt appended to
    /// the conversation, re-invoking the same effective model, at most
    /// `max_empty_retries` times.
    pub async fn execute(
        &self,
        mut request: ChatCompletionRequest,
        session_id: &str,
    ) -> Result<RequestOutcome, ProxyError> {
        // One-shot: a previous response carried an edit-failure marker.
        let edit_pending = self.sessions.take_edit_precision_pending(session_id);
        if edit_pending > 0 {
            info!(
                session_id,
                edit_pending, "applying edit-precision sampling overrides"
            );
            request.temperature = Some(EDIT_PRECISION_TEMPERATURE);
            request.top_p = Some(EDIT_PRECISION_TOP_P);
        }

        let requested_model = self
            .sessions
            .snapshot(session_id)
            .and_then(|s| s.model_override)
            .unwrap_or_else(|| request.model.clone());
        let (connector, effective_model) = self.connectors.resolve(&requested_model)?;
        debug!(
            session_id,
            backend = connector.name(),
            model = effective_model,
            "dispatching chat request"
        );

        let hints = ResponseHints {
            expected_json: None,
            content_type: None,
            response_schema: request.response_schema().cloned(),
        };

        let mut attempts = 0u32;
        loop {
            let backend_response = connector
                .chat_completions(&request, &effective_model)
                .await?;

            match backend_response {
                BackendResponse::Streaming(envelope) => {
                    let stream = self.responses.process_streaming_bytes(
                        envelope.stream,
                        session_id,
                        &hints,
                    );
                    return Ok(RequestOutcome::Streaming {
                        stream,
                        media_type: envelope.media_type,
                    });
                }
                BackendResponse::Buffered(envelope) => {
                    let mut hints = hints.clone();
                    hints.content_type = envelope
                        .headers
                        .get(axum::http::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);

                    match self
                        .responses
                        .process_response(envelope.content, session_id, &hints)
                        .await
                    {
                        Ok(processed) => return Ok(RequestOutcome::Buffered(processed)),
                        Err(ProxyError::EmptyResponseRetry {
                            recovery_prompt,
                            retry_count,
                        }) => {
                            if attempts >= self.max_empty_retries {
                                return Err(ProxyError::backend(
                                    "empty response persisted beyond the retry budget",
                                ));
                            }
                            attempts += 1;
                            info!(
                                session_id,
                                retry_count, "empty response, retrying with recovery prompt"
                            );
                            request.messages.push(ChatMessage::user(recovery_prompt));
                        }
                        Err(other) => return Err(other),
                    }
                }
            }
        }
    }
}
