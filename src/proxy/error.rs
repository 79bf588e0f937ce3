use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid JSON body: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Request body must be a JSON object")]
    NotAnObject,
    #[error("Failed to read request body: {0}")]
    BodyRead(String),
    #[error("{backend} upstream unavailable ({class}): {message}")]
    Upstream {
        backend: &'static str,
        class: &'static str,
        message: String,
    },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidJson(_) | ProxyError::NotAnObject | ProxyError::BodyRead(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Upstream { .. } => "upstream_unavailable",
            _ => "invalid_request_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let message = match &self {
            ProxyError::InvalidJson(_) => "Invalid JSON body".to_string(),
            other => other.to_string(),
        };
        let body = serde_json::json!({
            "error": {
                "message": message,
                "type": self.error_type(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}
