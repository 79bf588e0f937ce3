use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};

use crate::config::Backend;

/// Per-route replacement names for one external model name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl ModelTarget {
    fn for_backend(&self, backend: Backend) -> Option<&str> {
        match backend {
            Backend::Normal => self.normal.as_deref(),
            Backend::Fallback => self.fallback.as_deref(),
        }
    }
}

pub type ModelMappingTable = HashMap<String, ModelTarget>;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("model mapping is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model mapping must be a JSON object keyed by model name")]
    NotAnObject,
}

/// Model name to send to `backend`. Unknown models and unset or blank targets pass through.
pub fn resolve<'a>(original: &'a str, backend: Backend, table: &'a ModelMappingTable) -> &'a str {
    table
        .get(original)
        .and_then(|target| target.for_backend(backend))
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(original)
}

/// Entries whose shape is wrong are skipped individually so one typo does not drop the table.
pub fn parse_model_mapping(bytes: &[u8]) -> Result<ModelMappingTable, MappingError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(entries) = value else {
        return Err(MappingError::NotAnObject);
    };

    let mut table = ModelMappingTable::with_capacity(entries.len());
    for (model, raw) in entries {
        match serde_json::from_value::<ModelTarget>(raw) {
            Ok(target) => {
                table.insert(model, target);
            }
            Err(err) => warn!("skipping model mapping entry '{model}': {err}"),
        }
    }
    Ok(table)
}

/// Load the mapping file; a missing or malformed file yields an empty table.
pub async fn load_model_mapping(path: &Path) -> ModelMappingTable {
    let bytes = match fs::read(path).await {
        Ok(b) => b,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!("model mapping file not found: {}", path.display());
            return ModelMappingTable::new();
        }
        Err(err) => {
            error!("failed to read model mapping file {}: {err}", path.display());
            return ModelMappingTable::new();
        }
    };

    match parse_model_mapping(&bytes) {
        Ok(table) => {
            info!(
                "loaded model mapping from {} ({} models)",
                path.display(),
                table.len()
            );
            table
        }
        Err(err) => {
            error!("invalid model mapping file {}: {err}", path.display());
            ModelMappingTable::new()
        }
    }
}
