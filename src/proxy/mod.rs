use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use reqwest::Client;
use tracing::{Span, info, instrument, warn};

mod classify;
mod error;
mod fallback;
mod request;
mod runtime_mapping;
mod stream;
mod upstream;

pub use self::runtime_mapping::RuntimeMapping;
pub use self::upstream::build_http_client;

use self::classify::transport_error_class;
use self::error::ProxyError;
use self::fallback::FallbackRouter;
use self::request::ChatRequest;
use self::upstream::{CHAT_COMPLETIONS_PATH, MODELS_PATH, UpstreamClient};
use crate::config::{AppConfig, Backend};
use crate::state::OutcomeSink;

/// Largest client request body accepted on the chat endpoint.
pub const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyService {
    upstream: UpstreamClient,
    fallback: FallbackRouter,
    mappings: Arc<RuntimeMapping>,
    models_backend: Backend,
}

impl ProxyService {
    pub fn new(
        client: Client,
        cfg: &AppConfig,
        mappings: Arc<RuntimeMapping>,
        sink: Arc<dyn OutcomeSink>,
    ) -> Self {
        let upstream = UpstreamClient::from_config(client, cfg);
        Self {
            fallback: FallbackRouter::new(upstream.clone(), sink, cfg.max_stream_buffer_bytes),
            upstream,
            mappings,
            models_backend: cfg.models_backend,
        }
    }

    async fn chat_completions(
        &self,
        client_headers: HeaderMap,
        body: Body,
    ) -> Result<Response, ProxyError> {
        let raw = to_bytes(body, MAX_REQUEST_BODY_BYTES)
            .await
            .map_err(|e| ProxyError::BodyRead(e.to_string()))?;
        let req = ChatRequest::from_slice(&raw)?;
        let stream = req.is_stream();
        Span::current().record("stream", stream);
        info!(
            "chat completion request: model={} stream={stream}",
            req.model().unwrap_or("<none>")
        );

        self.mappings.maybe_reload_from_disk().await;
        let table = self.mappings.snapshot().await;

        if stream {
            self.fallback.stream(&req, &table, &client_headers).await
        } else {
            self.fallback.complete(&req, &table, &client_headers).await
        }
    }
}

#[instrument(skip_all, fields(request_id = %uuid::Uuid::new_v4(), stream = tracing::field::Empty))]
pub async fn handle_chat_completions(
    proxy: ProxyService,
    client_headers: HeaderMap,
    body: Body,
) -> Response {
    match proxy.chat_completions(client_headers, body).await {
        Ok(resp) => resp,
        Err(err) => {
            warn!("chat completion request failed: {err}");
            err.into_response()
        }
    }
}

#[instrument(skip_all)]
pub async fn handle_models(proxy: ProxyService, client_headers: HeaderMap) -> Response {
    match proxy
        .upstream
        .models(proxy.models_backend, &client_headers)
        .await
    {
        Ok(reply) => (reply.status, Json(reply.body)).into_response(),
        Err(err) => {
            let class = transport_error_class(&err);
            warn!("model list request failed ({class}): {err}");
            ProxyError::Upstream {
                backend: proxy.models_backend.as_str(),
                class,
                message: err.to_string(),
            }
            .into_response()
        }
    }
}

pub fn router(proxy: ProxyService) -> Router {
    async fn health() -> Json<serde_json::Value> {
        Json(serde_json::json!({ "status": "healthy" }))
    }

    async fn reload(proxy: ProxyService) -> (StatusCode, Json<serde_json::Value>) {
        let models = proxy.mappings.force_reload().await;
        (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "reloaded", "models": models })),
        )
    }

    let p0 = proxy.clone();
    let p1 = proxy.clone();
    let p2 = proxy;

    Router::new()
        .route(
            CHAT_COMPLETIONS_PATH,
            post(move |headers, body| handle_chat_completions(p0.clone(), headers, body)),
        )
        .route(
            MODELS_PATH,
            get(move |headers| handle_models(p1.clone(), headers)),
        )
        .route("/health", get(health))
        .route("/reload", post(move || reload(p2.clone())))
}
