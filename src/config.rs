//! Configuration loader and validator for the JSON outbox.
use crate::model::Capabilities;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub outbox: Outbox,
    pub transport: Transport,
    #[serde(default)]
    pub capabilities: CapabilityFlags,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// How often the agent daemon wakes itself to drain.
    pub poll_interval_ms: u64,
}

/// Storage keys and signal names shared by every context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Outbox {
    /// Defaults to `sqlite://<data_dir>/outbox.db`.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_sync_tag")]
    pub sync_tag: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default = "default_broadcast_key")]
    pub broadcast_key: String,
    #[serde(default = "default_fallback_key")]
    pub fallback_key: String,
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transport {
    /// Base for relative endpoints such as `/api/comments`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 0 leaves timeouts to the network stack.
    #[serde(default)]
    pub timeout_seconds: u64,
}

/// Switches for each delivery tier. Anything switched off here is treated as
/// absent even when the environment offers it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityFlags {
    #[serde(default = "yes")]
    pub durable_store: bool,
    #[serde(default = "yes")]
    pub immediate_commit: bool,
    #[serde(default = "yes")]
    pub background_agent: bool,
    #[serde(default = "yes")]
    pub best_effort_transport: bool,
    #[serde(default = "yes")]
    pub fallback_storage: bool,
}

impl Default for CapabilityFlags {
    fn default() -> Self {
        Self {
            durable_store: true,
            immediate_commit: true,
            background_agent: true,
            best_effort_transport: true,
            fallback_storage: true,
        }
    }
}

impl CapabilityFlags {
    pub fn to_capabilities(self) -> Capabilities {
        Capabilities {
            has_durable_store: self.durable_store,
            has_sync_commit: self.immediate_commit,
            has_background_agent: self.background_agent,
            has_best_effort_transport: self.best_effort_transport,
            has_fallback_storage: self.fallback_storage,
        }
    }
}

fn yes() -> bool {
    true
}

fn default_sync_tag() -> String {
    crate::agent::DEFAULT_SYNC_TAG.to_string()
}

fn default_message_type() -> String {
    crate::notifier::DEFAULT_MESSAGE_TYPE.to_string()
}

fn default_broadcast_key() -> String {
    crate::notifier::DEFAULT_BROADCAST_KEY.to_string()
}

fn default_fallback_key() -> String {
    crate::fallback::DEFAULT_FALLBACK_KEY.to_string()
}

fn default_user_agent() -> String {
    concat!("json-outbox/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the file, which wins over the data_dir default.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.outbox.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/outbox.db", self.app.data_dir))
    }

    /// Directory backing the flat-list fallback storage.
    pub fn fallback_dir(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join("fallback")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.transport.timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn base_url(&self) -> Option<Url> {
        self.transport
            .base_url
            .as_deref()
            .and_then(|u| Url::parse(u).ok())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if let Some(url) = &cfg.outbox.database_url {
        if !url.starts_with("sqlite:") {
            return Err(ConfigError::Invalid("outbox.database_url must be a sqlite: URL"));
        }
    }
    if cfg.outbox.sync_tag.trim().is_empty() {
        return Err(ConfigError::Invalid("outbox.sync_tag must be non-empty"));
    }
    if cfg.outbox.message_type.trim().is_empty() {
        return Err(ConfigError::Invalid("outbox.message_type must be non-empty"));
    }
    if cfg.outbox.broadcast_key.trim().is_empty() {
        return Err(ConfigError::Invalid("outbox.broadcast_key must be non-empty"));
    }
    if cfg.outbox.fallback_key.trim().is_empty() {
        return Err(ConfigError::Invalid("outbox.fallback_key must be non-empty"));
    }
    if cfg.outbox.fallback_key == cfg.outbox.broadcast_key {
        return Err(ConfigError::Invalid(
            "outbox.fallback_key and outbox.broadcast_key must differ",
        ));
    }

    if cfg.transport.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("transport.user_agent must be non-empty"));
    }
    if let Some(base) = &cfg.transport.base_url {
        if Url::parse(base).is_err() {
            return Err(ConfigError::Invalid("transport.base_url must be an absolute URL"));
        }
    }

    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 30000

outbox:
  # database_url: "sqlite://./data/outbox.db"
  sync_tag: "sendJSON"
  message_type: "syncCompleted"
  broadcast_key: "sendJSON"
  fallback_key: "sendJSON-outbox"

transport:
  base_url: "http://localhost:8080/"
  user_agent: "json-outbox/0.1"
  timeout_seconds: 30

capabilities:
  durable_store: true
  immediate_commit: true
  background_agent: true
  best_effort_transport: true
  fallback_storage: true
"#
}
