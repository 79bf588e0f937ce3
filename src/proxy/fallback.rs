use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{StreamExt, stream};
use serde_json::{Map, Value};
use tracing::{Instrument, info, warn};

use super::classify::{
    Completion, EmptyReason, Verdict, classify_completion, transport_error_class,
};
use super::error::ProxyError;
use super::request::ChatRequest;
use super::stream::{Drained, buffer_stream};
use super::upstream::UpstreamClient;
use crate::config::Backend;
use crate::model_routing::ModelMappingTable;
use crate::state::{Outcome, OutcomeSink};

/// Outcome of the normal streaming attempt once it has been drained (or abandoned).
enum StreamAttempt {
    Replay(Body),
    Empty(EmptyReason),
}

/// Normal-then-fallback dispatch for one chat completion.
///
/// Exactly one outcome is recorded per request, at the moment the route is decided.
#[derive(Clone)]
pub struct FallbackRouter {
    upstream: UpstreamClient,
    sink: Arc<dyn OutcomeSink>,
    max_stream_buffer_bytes: Option<usize>,
}

impl FallbackRouter {
    pub fn new(
        upstream: UpstreamClient,
        sink: Arc<dyn OutcomeSink>,
        max_stream_buffer_bytes: Option<usize>,
    ) -> Self {
        Self {
            upstream,
            sink,
            max_stream_buffer_bytes,
        }
    }

    pub async fn complete(
        &self,
        req: &ChatRequest,
        table: &ModelMappingTable,
        client_headers: &HeaderMap,
    ) -> Result<Response, ProxyError> {
        let normal_body = req.body_for(Backend::Normal, table);
        let reason = match self
            .upstream
            .send(Backend::Normal, &normal_body, client_headers)
            .await
        {
            Ok(reply) => match classify_completion(reply.status, Completion::Json(&reply.body)) {
                Verdict::NonEmpty => {
                    self.sink.record(Outcome::Normal);
                    return Ok((reply.status, Json(reply.body)).into_response());
                }
                Verdict::Empty(reason) => reason,
            },
            Err(err) => {
                let class = transport_error_class(&err);
                warn!("normal upstream request failed ({class}): {err}");
                EmptyReason::Transport(class.to_string())
            }
        };
        warn!("normal upstream returned an unusable response ({reason}); falling back");
        self.sink.record(Outcome::Fallback);

        let fallback_body = req.body_for(Backend::Fallback, table);
        match self
            .upstream
            .send(Backend::Fallback, &fallback_body, client_headers)
            .await
        {
            Ok(reply) => Ok((reply.status, Json(reply.body)).into_response()),
            Err(err) => Err(fallback_unavailable(&err)),
        }
    }

    pub async fn stream(
        &self,
        req: &ChatRequest,
        table: &ModelMappingTable,
        client_headers: &HeaderMap,
    ) -> Result<Response, ProxyError> {
        let normal_body = req.body_for(Backend::Normal, table).into_owned();

        // Runs detached so a client that goes away mid-buffering does not cut the attempt short.
        let attempt = tokio::spawn(
            normal_stream_attempt(
                self.upstream.clone(),
                normal_body,
                client_headers.clone(),
                self.max_stream_buffer_bytes,
            )
            .in_current_span(),
        );
        let attempt = match attempt.await {
            Ok(a) => a,
            Err(err) => {
                warn!("normal stream attempt aborted: {err}");
                StreamAttempt::Empty(EmptyReason::Transport("task_aborted".to_string()))
            }
        };

        match attempt {
            StreamAttempt::Replay(body) => {
                self.sink.record(Outcome::Normal);
                Ok(sse_response(StatusCode::OK, None, body))
            }
            StreamAttempt::Empty(reason) => {
                warn!("normal upstream stream unusable ({reason}); falling back");
                self.sink.record(Outcome::Fallback);

                let fallback_body = req.body_for(Backend::Fallback, table);
                match self
                    .upstream
                    .stream(Backend::Fallback, &fallback_body, client_headers)
                    .await
                {
                    Ok(reply) => {
                        info!("piping fallback stream through (status {})", reply.status);
                        let content_type = if reply.status == StatusCode::OK {
                            None
                        } else {
                            reply.content_type
                        };
                        Ok(sse_response(
                            reply.status,
                            content_type,
                            Body::from_stream(reply.chunks),
                        ))
                    }
                    Err(err) => Err(fallback_unavailable(&err)),
                }
            }
        }
    }
}

async fn normal_stream_attempt(
    upstream: UpstreamClient,
    body: Map<String, Value>,
    client_headers: HeaderMap,
    limit: Option<usize>,
) -> StreamAttempt {
    let reply = match upstream
        .stream(Backend::Normal, &body, &client_headers)
        .await
    {
        Ok(r) => r,
        Err(err) => {
            let class = transport_error_class(&err);
            warn!("normal upstream stream request failed ({class}): {err}");
            return StreamAttempt::Empty(EmptyReason::Transport(class.to_string()));
        }
    };
    if reply.status != StatusCode::OK {
        return StreamAttempt::Empty(EmptyReason::Status(reply.status.as_u16()));
    }

    match buffer_stream(reply.chunks, limit).await {
        Drained::Complete(transcript) => {
            match classify_completion(StatusCode::OK, Completion::Transcript(transcript.text())) {
                Verdict::NonEmpty => {
                    info!(
                        "replaying buffered normal stream ({} chunks, {} bytes)",
                        transcript.chunk_count(),
                        transcript.buffered_bytes()
                    );
                    let chunks = transcript.into_chunks();
                    StreamAttempt::Replay(Body::from_stream(stream::iter(
                        chunks.into_iter().map(Ok::<Bytes, Infallible>),
                    )))
                }
                Verdict::Empty(reason) => StreamAttempt::Empty(reason),
            }
        }
        Drained::Overflow { transcript, rest } => {
            info!(
                "stream buffer ceiling reached after {} bytes; passing normal stream through",
                transcript.buffered_bytes()
            );
            let head = stream::iter(
                transcript
                    .into_chunks()
                    .into_iter()
                    .map(Ok::<Bytes, reqwest::Error>),
            );
            StreamAttempt::Replay(Body::from_stream(head.chain(rest)))
        }
        Drained::Failed { transcript, error } => {
            let class = transport_error_class(&error);
            warn!(
                "normal upstream stream broke after {} bytes ({class}): {error}",
                transcript.buffered_bytes()
            );
            StreamAttempt::Empty(EmptyReason::Transport(class.to_string()))
        }
    }
}

fn sse_response(status: StatusCode, content_type: Option<HeaderValue>, body: Body) -> Response {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        content_type.unwrap_or_else(|| HeaderValue::from_static("text/event-stream")),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    resp
}

fn fallback_unavailable(err: &reqwest::Error) -> ProxyError {
    let class = transport_error_class(err);
    warn!("fallback upstream request failed ({class}): {err}");
    ProxyError::Upstream {
        backend: Backend::Fallback.as_str(),
        class,
        message: err.to_string(),
    }
}
