//! HTTP ingress: application assembly and the axum router.

mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::connectors::{
    ConnectorRegistry, GeminiOAuthPersonalConnector, OAuthFileStore, OpenAIConnector,
    OpenAIOAuthConnector,
};
use crate::error::ProxyError;
use crate::middleware::{
    ContentFilterMiddleware, EditPrecisionResponseMiddleware, EmptyResponseMiddleware,
    JsonRepairMiddleware, LoggingMiddleware, LoopDetectionMiddleware,
    MiddlewareApplicationManager, ResponseMiddleware, StructuredOutputMiddleware,
    ToolCallLoopDetectionMiddleware,
};
use crate::processor::{RequestProcessor, ResponseProcessor};
use crate::session::SessionStore;
use crate::streaming::{
    ContentAccumulationProcessor, JsonRepairProcessor, LoopDetectionProcessor,
    MiddlewareApplicationProcessor, StreamNormalizer, StreamProcessor,
    ToolCallRepairProcessor,
};
use crate::translation::{DialectTranslation, TranslationService};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub requests: Arc<RequestProcessor>,
    pub connectors: Arc<ConnectorRegistry>,
    pub sessions: Arc<SessionStore>,
    pub translation: Arc<dyn TranslationService>,
}

/// Wire the whole pipeline together from configuration.
pub async fn bootstrap(config: &AppConfig) -> Result<AppState, ProxyError> {
    let sessions = Arc::new(SessionStore::new(config.loop_config()));

    let middleware: Vec<Arc<dyn ResponseMiddleware>> = vec![
        Arc::new(LoggingMiddleware),
        Arc::new(ContentFilterMiddleware::default()),
        Arc::new(JsonRepairMiddleware::new()),
        Arc::new(StructuredOutputMiddleware::default()),
        Arc::new(LoopDetectionMiddleware::new()),
        Arc::new(ToolCallLoopDetectionMiddleware),
        Arc::new(EditPrecisionResponseMiddleware),
        Arc::new(EmptyResponseMiddleware::new(
            true,
            config.empty_response_max_retries,
        )),
    ];
    let manager = Arc::new(MiddlewareApplicationManager::new(middleware));

    // The default streaming chain: tool-call repair, JSON repair, loop
    // detection, content accumulation, middleware application.
    let processors: Vec<Arc<dyn StreamProcessor>> = vec![
        Arc::new(ToolCallRepairProcessor::default()),
        Arc::new(JsonRepairProcessor::new(config.json_repair_buffer_cap)),
        Arc::new(LoopDetectionProcessor::default()),
        Arc::new(ContentAccumulationProcessor::new(
            config.content_buffer_max_bytes,
        )),
        Arc::new(MiddlewareApplicationProcessor::new(
            manager.clone(),
            sessions.clone(),
        )),
    ];
    let normalizer = Arc::new(StreamNormalizer::new(processors));

    let responses = Arc::new(ResponseProcessor::new(
        normalizer,
        manager,
        sessions.clone(),
    ));

    let mut registry = ConnectorRegistry::new(config.default_backend.clone());
    registry.register(Arc::new(OpenAIConnector::new(
        config.openai_api_base.clone(),
        config.openai_api_key.clone(),
    )?));
    match OAuthFileStore::codex_default() {
        Ok(store) => registry.register(Arc::new(OpenAIOAuthConnector::new(
            config.openai_api_base.clone(),
            store,
        )?)),
        Err(e) => warn!(error = %e, "openai-oauth connector unavailable"),
    }
    match OAuthFileStore::gemini_default() {
        Ok(store) => registry.register(Arc::new(GeminiOAuthPersonalConnector::new(store)?)),
        Err(e) => warn!(error = %e, "gemini oauth connector unavailable"),
    }

    // Best-effort startup checks; lazily-authenticated connectors report
    // failures at first use instead.
    for (name, connector) in registry.backends() {
        if let Err(e) = connector.initialize().await {
            warn!(backend = %name, error = %e, "connector failed startup initialization");
        } else {
            info!(backend = %name, "connector ready");
        }
    }

    let connectors = Arc::new(registry);
    let requests = Arc::new(RequestProcessor::new(
        connectors.clone(),
        responses,
        sessions.clone(),
        config.empty_response_max_retries,
    ));

    Ok(AppState {
        requests,
        connectors,
        sessions,
        translation: Arc::new(DialectTranslation),
    })
}

/// Build the router with the three ingress dialects.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::openai_chat))
        .route("/v1/anthropic/messages", post(handlers::anthropic_messages))
        .route("/anthropic/v1/messages", post(handlers::anthropic_messages))
        .route(
            "/gemini/v1beta/models/{model_action}",
            post(handlers::gemini_generate),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn run(config: AppConfig) -> Result<(), ProxyError> {
    let state = bootstrap(&config).await?;
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ProxyError::Configuration {
            message: format!("cannot bind {addr}: {e}"),
        })?;
    info!(addr, "gateway listening");

    axum::serve(listener, router)
        .await
        .map_err(|e| ProxyError::internal(format!("server error: {e}")))
}
