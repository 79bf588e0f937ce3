use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::{AppConfig, Backend, BackendRoute, UpstreamTimeouts};

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub const MODELS_PATH: &str = "/v1/models";

/// Client headers copied to the upstream request. Everything else is dropped.
const FORWARDED_HEADERS: [&str; 2] = ["user-agent", "x-request-id"];

/// Single-pass upstream body; dropping it closes the connection.
pub type ChunkStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

#[derive(Debug)]
pub struct UnaryReply {
    pub status: StatusCode,
    pub body: Value,
}

pub struct StreamReply {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub chunks: ChunkStream,
}

pub fn build_http_client(timeouts: UpstreamTimeouts) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(timeouts.connect)
        .read_timeout(timeouts.read)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
}

/// Shared, pooled client for both upstream routes. Cheap to clone.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    normal: Arc<BackendRoute>,
    fallback: Arc<BackendRoute>,
}

impl UpstreamClient {
    pub fn new(client: Client, normal: BackendRoute, fallback: BackendRoute) -> Self {
        Self {
            client,
            normal: Arc::new(normal),
            fallback: Arc::new(fallback),
        }
    }

    pub fn from_config(client: Client, cfg: &AppConfig) -> Self {
        Self::new(client, cfg.normal.clone(), cfg.fallback.clone())
    }

    pub fn route(&self, backend: Backend) -> &BackendRoute {
        match backend {
            Backend::Normal => &self.normal,
            Backend::Fallback => &self.fallback,
        }
    }

    /// POST a chat completion and read the whole body.
    pub async fn send(
        &self,
        backend: Backend,
        body: &Map<String, Value>,
        client_headers: &HeaderMap,
    ) -> Result<UnaryReply, reqwest::Error> {
        let route = self.route(backend);
        let url = route.endpoint(CHAT_COMPLETIONS_PATH);
        info!("forwarding request to {backend} upstream: {url}");

        let resp = self
            .client
            .post(url)
            .headers(upstream_headers(route, client_headers))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        info!("{backend} upstream responded with status {status}");
        let bytes = resp.bytes().await?;
        Ok(UnaryReply {
            status,
            body: parse_or_wrap(&bytes),
        })
    }

    /// POST a chat completion and hand back the body as a lazy chunk stream.
    pub async fn stream(
        &self,
        backend: Backend,
        body: &Map<String, Value>,
        client_headers: &HeaderMap,
    ) -> Result<StreamReply, reqwest::Error> {
        let route = self.route(backend);
        let url = route.endpoint(CHAT_COMPLETIONS_PATH);
        info!("forwarding streaming request to {backend} upstream: {url}");

        let resp = self
            .client
            .post(url)
            .headers(upstream_headers(route, client_headers))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        info!("{backend} upstream stream responded with status {status}");
        Ok(StreamReply {
            status,
            content_type: resp.headers().get(CONTENT_TYPE).cloned(),
            chunks: resp.bytes_stream().boxed(),
        })
    }

    pub async fn models(
        &self,
        backend: Backend,
        client_headers: &HeaderMap,
    ) -> Result<UnaryReply, reqwest::Error> {
        let route = self.route(backend);
        let url = route.endpoint(MODELS_PATH);
        info!("forwarding model list request to {backend} upstream: {url}");

        let resp = self
            .client
            .get(url)
            .headers(upstream_headers(route, client_headers))
            .send()
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        Ok(UnaryReply {
            status,
            body: parse_or_wrap(&bytes),
        })
    }
}

/// Configured key wins; without one the caller's own `authorization` is passed through.
pub(super) fn upstream_headers(route: &BackendRoute, client_headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    match route.api_key.as_deref() {
        Some(key) => {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {key}")) {
                out.insert(AUTHORIZATION, v);
            }
        }
        None => {
            if let Some(v) = client_headers.get(AUTHORIZATION) {
                out.insert(AUTHORIZATION, v.clone());
            }
        }
    }
    for name in FORWARDED_HEADERS {
        if let Some(v) = client_headers.get(name) {
            out.insert(HeaderName::from_static(name), v.clone());
        }
    }
    out
}

/// Non-JSON upstream bodies become `{"error": <text>}`.
pub(super) fn parse_or_wrap(bytes: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(v) => v,
        Err(err) => {
            debug!("upstream body is not JSON ({err}); wrapping as error text");
            serde_json::json!({ "error": String::from_utf8_lossy(bytes) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn client_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_static("Bearer client-token"));
        h.insert("user-agent", HeaderValue::from_static("test-agent/1.0"));
        h.insert("x-request-id", HeaderValue::from_static("req-1"));
        h.insert("cookie", HeaderValue::from_static("session=abc"));
        h.insert("x-api-key", HeaderValue::from_static("leak"));
        h
    }

    #[test]
    fn configured_key_replaces_client_authorization() {
        let route = BackendRoute::new(Backend::Fallback, "http://fb", Some("sk-fb".to_string()));
        let out = upstream_headers(&route, &client_headers());
        assert_eq!(out.get(AUTHORIZATION).unwrap(), "Bearer sk-fb");
        assert_eq!(out.get("user-agent").unwrap(), "test-agent/1.0");
        assert_eq!(out.get("x-request-id").unwrap(), "req-1");
        assert!(out.get("cookie").is_none());
        assert!(out.get("x-api-key").is_none());
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn missing_key_passes_client_authorization_through() {
        let route = BackendRoute::new(Backend::Normal, "http://n", None);
        let out = upstream_headers(&route, &client_headers());
        assert_eq!(out.get(AUTHORIZATION).unwrap(), "Bearer client-token");
    }

    #[test]
    fn no_key_and_no_client_authorization_sends_none() {
        let route = BackendRoute::new(Backend::Normal, "http://n", Some("   ".to_string()));
        let out = upstream_headers(&route, &HeaderMap::new());
        assert!(out.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn non_json_body_is_wrapped() {
        assert_eq!(
            parse_or_wrap(b"<html>bad gateway</html>"),
            serde_json::json!({ "error": "<html>bad gateway</html>" })
        );
        assert_eq!(
            parse_or_wrap(br#"{"ok":true}"#),
            serde_json::json!({ "ok": true })
        );
    }

    #[test]
    fn endpoint_strips_trailing_slashes() {
        let route = BackendRoute::new(Backend::Normal, "http://host:1/base//", None);
        assert_eq!(
            route.endpoint(CHAT_COMPLETIONS_PATH),
            "http://host:1/base/v1/chat/completions"
        );
    }
}
