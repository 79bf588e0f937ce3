use std::borrow::Cow;

use serde_json::{Map, Value};

use super::error::ProxyError;
use crate::config::Backend;
use crate::model_routing::{ModelMappingTable, resolve};

/// Inbound chat body: an open JSON object where only `model` and `stream` are interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    body: Map<String, Value>,
}

impl ChatRequest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProxyError> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(body)) => Ok(Self { body }),
            Ok(_) => Err(ProxyError::NotAnObject),
            Err(err) => Err(ProxyError::InvalidJson(err)),
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.body.get("model").and_then(|m| m.as_str())
    }

    pub fn is_stream(&self) -> bool {
        self.body
            .get("stream")
            .and_then(|s| s.as_bool())
            .unwrap_or(false)
    }

    /// Body to send to `backend`: identical to the inbound one except for a remapped `model`.
    pub fn body_for<'a>(
        &'a self,
        backend: Backend,
        table: &ModelMappingTable,
    ) -> Cow<'a, Map<String, Value>> {
        let Some(original) = self.model() else {
            return Cow::Borrowed(&self.body);
        };
        let mapped = resolve(original, backend, table);
        if mapped == original {
            return Cow::Borrowed(&self.body);
        }
        tracing::info!("model mapping ({backend}): {original} -> {mapped}");
        let mut body = self.body.clone();
        body.insert("model".to_string(), Value::String(mapped.to_string()));
        Cow::Owned(body)
    }
}
