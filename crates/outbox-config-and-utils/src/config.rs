//! Configuration management for the daemon.

use crate::{CoreError, CoreResult, Paths};
use event_outbox::OutboxConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default collector endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/track";

/// Main daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Collector URL batches are POSTed to.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Bearer token sent with every batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Batching and retry settings.
    #[serde(default)]
    pub outbox: OutboxConfig,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            endpoint: default_endpoint(),
            auth_token: None,
            outbox: OutboxConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config file, falling back to defaults,
    /// then apply environment overrides.
    ///
    /// The result is not validated, so callers can apply their own
    /// overrides first; call [`Config::validate`] afterwards.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override fields from `OUTBOX_*` variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(log_level) = lookup("OUTBOX_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(endpoint) = lookup("OUTBOX_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(token) = lookup("OUTBOX_AUTH_TOKEN") {
            let token = token.trim().to_string();
            self.auth_token = (!token.is_empty()).then_some(token);
        }
        if let Some(raw) = lookup("OUTBOX_BATCH_SIZE") {
            self.outbox.batch_size = parse_env("OUTBOX_BATCH_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("OUTBOX_FLUSH_INTERVAL_MS") {
            self.outbox.flush_interval_ms = parse_env("OUTBOX_FLUSH_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("OUTBOX_REQUEST_TIMEOUT_MS") {
            self.outbox.request_timeout_ms = parse_env("OUTBOX_REQUEST_TIMEOUT_MS", &raw)?;
        }
        Ok(())
    }

    /// Check the endpoint and the outbox settings.
    pub fn validate(&self) -> CoreResult<()> {
        self.endpoint_url()?;
        self.outbox.validate()?;
        Ok(())
    }

    /// Get the collector endpoint as a parsed URL.
    pub fn endpoint_url(&self) -> CoreResult<Url> {
        let url = Url::parse(&self.endpoint)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(CoreError::Config(format!(
                "endpoint must use http or https, got {other}"
            ))),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> CoreResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| CoreError::Config(format!("{name} must be a number, got {raw:?}")))
}
