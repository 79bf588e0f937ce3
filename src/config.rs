use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs::home_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_SERVER_PORT: u16 = 8003;
pub const DEFAULT_STATS_PORT: u16 = 8004;
const DEFAULT_MAPPING_FILE: &str = "model_mapping.json";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("{key} is not a valid http(s) URL ({value}): {reason}")]
    InvalidUrl {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key} has an invalid value: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Which of the two interchangeable upstreams a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Normal,
    Fallback,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Normal => "normal",
            Backend::Fallback => "fallback",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normal" => Some(Backend::Normal),
            "fallback" => Some(Backend::Fallback),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upstream address plus the credential used when talking to it.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendRoute {
    pub backend: Backend,
    pub base_url: String,
    /// `None` means the caller's own `authorization` header is passed through.
    pub api_key: Option<String>,
}

impl BackendRoute {
    pub fn new(backend: Backend, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            backend,
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn endpoint(&self, suffix: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), suffix)
    }
}

impl fmt::Debug for BackendRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRoute")
            .field("backend", &self.backend)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileRouteConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

/// On-disk shape of `config.toml`; every key is optional and env vars win over it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub listen_host: Option<String>,
    pub server_port: Option<u16>,
    pub stats_port: Option<u16>,
    pub normal: FileRouteConfig,
    pub fallback: FileRouteConfig,
    pub model_mapping_file: Option<PathBuf>,
    pub mapping_auto_reload: Option<bool>,
    pub models_backend: Option<Backend>,
    pub max_stream_buffer_bytes: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_host: String,
    pub server_port: u16,
    /// `0` disables the stats listener.
    pub stats_port: u16,
    pub normal: BackendRoute,
    pub fallback: BackendRoute,
    pub model_mapping_file: PathBuf,
    pub mapping_auto_reload: bool,
    pub models_backend: Backend,
    pub max_stream_buffer_bytes: Option<usize>,
    pub timeouts: UpstreamTimeouts,
}

impl AppConfig {
    /// Resolve the effective config from the optional TOML file and the process environment.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match explicit_path {
            Some(path) => read_file_config(path)?,
            None => match env::var("FALLBACK_RELAY_CONFIG")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
            {
                Some(path) => read_file_config(Path::new(&path))?,
                None => {
                    let path = default_config_path();
                    if path.exists() {
                        read_file_config(&path)?
                    } else {
                        FileConfig::default()
                    }
                }
            },
        };
        Self::from_sources(file, |key| env::var(key).ok())
    }

    pub fn from_sources<F>(file: FileConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let normal_url = get("UPSTREAM_NORMAL").or(file.normal.base_url.clone());
        let fallback_url = get("UPSTREAM_FALLBACK").or(file.fallback.base_url.clone());

        let mut missing = Vec::new();
        if normal_url.as_deref().is_none_or(|s| s.trim().is_empty()) {
            missing.push("UPSTREAM_NORMAL");
        }
        if fallback_url.as_deref().is_none_or(|s| s.trim().is_empty()) {
            missing.push("UPSTREAM_FALLBACK");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let normal_url = normal_url.unwrap_or_default();
        let fallback_url = fallback_url.unwrap_or_default();
        validate_base_url("UPSTREAM_NORMAL", &normal_url)?;
        validate_base_url("UPSTREAM_FALLBACK", &fallback_url)?;

        let server_port = parse_value("SERVER_PORT", get("SERVER_PORT"))?
            .or(file.server_port)
            .unwrap_or(DEFAULT_SERVER_PORT);
        let stats_port = parse_value("WEBUI_PORT", get("WEBUI_PORT"))?
            .or(file.stats_port)
            .unwrap_or(DEFAULT_STATS_PORT);
        let mapping_auto_reload = match get("MODEL_MAPPING_AUTO_RELOAD") {
            Some(raw) => Some(parse_bool(&raw).ok_or(ConfigError::InvalidValue {
                key: "MODEL_MAPPING_AUTO_RELOAD",
                value: raw,
            })?),
            None => file.mapping_auto_reload,
        }
        .unwrap_or(false);
        let models_backend = match get("MODELS_BACKEND") {
            Some(raw) => Backend::parse(&raw).ok_or(ConfigError::InvalidValue {
                key: "MODELS_BACKEND",
                value: raw,
            })?,
            None => file.models_backend.unwrap_or_default(),
        };
        let max_stream_buffer_bytes =
            parse_value("MAX_STREAM_BUFFER_BYTES", get("MAX_STREAM_BUFFER_BYTES"))?
                .or(file.max_stream_buffer_bytes)
                .filter(|&n: &usize| n > 0);
        let connect_secs = parse_value(
            "UPSTREAM_CONNECT_TIMEOUT_SECS",
            get("UPSTREAM_CONNECT_TIMEOUT_SECS"),
        )?
        .or(file.connect_timeout_secs)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        let read_secs = parse_value("UPSTREAM_READ_TIMEOUT_SECS", get("UPSTREAM_READ_TIMEOUT_SECS"))?
            .or(file.read_timeout_secs)
            .unwrap_or(DEFAULT_READ_TIMEOUT_SECS);

        Ok(Self {
            listen_host: get("LISTEN_HOST")
                .or(file.listen_host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            server_port,
            stats_port,
            normal: BackendRoute::new(
                Backend::Normal,
                normal_url,
                get("UPSTREAM_NORMAL_KEY").or(file.normal.api_key),
            ),
            fallback: BackendRoute::new(
                Backend::Fallback,
                fallback_url,
                get("UPSTREAM_FALLBACK_KEY").or(file.fallback.api_key),
            ),
            model_mapping_file: get("MODEL_MAPPING_FILE")
                .map(PathBuf::from)
                .or(file.model_mapping_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MAPPING_FILE)),
            mapping_auto_reload,
            models_backend,
            max_stream_buffer_bytes,
            timeouts: UpstreamTimeouts {
                connect: Duration::from_secs(connect_secs.max(1)),
                read: Duration::from_secs(read_secs.max(1)),
            },
        })
    }

    pub fn log_summary(&self) {
        info!("normal upstream: {}", self.normal.base_url);
        info!("fallback upstream: {}", self.fallback.base_url);
        info!(
            "listen: {}:{} (stats port: {})",
            self.listen_host, self.server_port, self.stats_port
        );
        info!(
            "model mapping file: {} (auto reload: {})",
            self.model_mapping_file.display(),
            self.mapping_auto_reload
        );
    }

    /// Human-readable view with credentials redacted, used by `check-config`.
    pub fn describe(&self) -> Vec<String> {
        fn key_note(route: &BackendRoute) -> &'static str {
            if route.api_key.is_some() {
                "configured"
            } else {
                "client passthrough"
            }
        }

        vec![
            format!("listen            {}:{}", self.listen_host, self.server_port),
            format!(
                "stats port        {}",
                if self.stats_port == 0 {
                    "disabled".to_string()
                } else {
                    self.stats_port.to_string()
                }
            ),
            format!(
                "normal upstream   {} (api key: {})",
                self.normal.base_url,
                key_note(&self.normal)
            ),
            format!(
                "fallback upstream {} (api key: {})",
                self.fallback.base_url,
                key_note(&self.fallback)
            ),
            format!(
                "model mapping     {} (auto reload: {})",
                self.model_mapping_file.display(),
                self.mapping_auto_reload
            ),
            format!("models backend    {}", self.models_backend),
            format!(
                "stream buffer     {}",
                self.max_stream_buffer_bytes
                    .map(|n| format!("{n} bytes"))
                    .unwrap_or_else(|| "unbounded".to_string())
            ),
            format!(
                "timeouts          connect={}s read={}s",
                self.timeouts.connect.as_secs(),
                self.timeouts.read.as_secs()
            ),
        ]
    }
}

fn validate_base_url(key: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = reqwest::Url::parse(value.trim()).map_err(|e| ConfigError::InvalidUrl {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            key,
            value: value.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(())
}

fn parse_value<T: std::str::FromStr>(
    key: &'static str,
    raw: Option<String>,
) -> Result<Option<T>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<FileConfig>(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Home directory for the relay (config file, logs).
pub fn proxy_home_dir() -> PathBuf {
    if let Ok(dir) = env::var("FALLBACK_RELAY_HOME") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fallback-relay")
}

pub fn default_config_path() -> PathBuf {
    proxy_home_dir().join("config.toml")
}
