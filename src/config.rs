use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks5,
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyKind::Http => write!(f, "http"),
            ProxyKind::Socks5 => write!(f, "socks5"),
        }
    }
}

impl std::str::FromStr for ProxyKind {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyKind::Http),
            "socks5" => Ok(ProxyKind::Socks5),
            other => Err(IngestError::config(format!(
                "unsupported proxy type '{}' (expected http or socks5)",
                other
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default = "default_storage_config")]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Target channel, e.g. "@NewQuark"
    #[serde(default)]
    pub channel: String,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"<redacted>")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Raw proxy settings as written by the user. Checked by [`ProxyConfig::validate`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// A proxy that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub kind: ProxyKind,
    pub address: String,
    pub port: u16,
}

impl ProxySettings {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.kind, self.address, self.port)
    }
}

impl ProxyConfig {
    /// Returns `Ok(None)` when the proxy is disabled. When enabled, type,
    /// address and port must all be present and well-formed.
    pub fn validate(&self) -> std::result::Result<Option<ProxySettings>, IngestError> {
        if !self.enabled {
            return Ok(None);
        }

        let kind: ProxyKind = self
            .kind
            .as_deref()
            .ok_or_else(|| IngestError::config("proxy enabled but proxy type is missing"))?
            .parse()?;

        let address = self
            .address
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();
        if address.is_empty() {
            return Err(IngestError::config("proxy enabled but proxy address is missing"));
        }
        if address.contains(char::is_whitespace) || address.contains('/') {
            return Err(IngestError::config(format!(
                "proxy address '{}' is not a host name or IP address",
                address
            )));
        }

        let port = match self.port {
            Some(0) => return Err(IngestError::config("proxy port must be between 1 and 65535")),
            Some(port) => port,
            None => return Err(IngestError::config("proxy enabled but proxy port is missing")),
        };

        Ok(Some(ProxySettings {
            kind,
            address: address.to_string(),
            port,
        }))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Concurrent media downloads
    #[serde(default = "default_media_workers")]
    pub media_workers: usize,
    /// Capacity of the listener -> pipeline queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_connect_retry")]
    pub connect_retry: RetryConfig,
    #[serde(default = "default_download_retry")]
    pub download_retry: RetryConfig,
    #[serde(default = "default_storage_retry")]
    pub storage_retry: RetryConfig,
    /// Six-field cron expression for the store heartbeat
    #[serde(default = "default_heartbeat_cron")]
    pub heartbeat_cron: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            media_workers: default_media_workers(),
            queue_capacity: default_queue_capacity(),
            keepalive_secs: default_keepalive_secs(),
            connect_retry: default_connect_retry(),
            download_retry: default_download_retry(),
            storage_retry: default_storage_retry(),
            heartbeat_cron: default_heartbeat_cron(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("messages.db")
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("media")
}

fn default_storage_config() -> StorageConfig {
    StorageConfig {
        database_path: default_db_path(),
        media_dir: default_media_dir(),
    }
}

fn default_media_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_heartbeat_cron() -> String {
    "0 0 * * * *".to_string()
}

fn default_connect_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 6,
        base_delay_ms: 1_000,
        max_delay_ms: 60_000,
        attempt_timeout_secs: Some(30),
    }
}

fn default_download_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay_ms: 500,
        max_delay_ms: 10_000,
        attempt_timeout_secs: Some(120),
    }
}

fn default_storage_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay_ms: 200,
        max_delay_ms: 2_000,
        attempt_timeout_secs: Some(10),
    }
}

impl Config {
    /// Load `path` if it exists, then apply environment overrides.
    /// Ingestion still has to call [`validate`](Self::validate).
    pub fn load(path: &Path) -> Result<Self> {
        let content = if path.exists() {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?
        } else {
            String::new()
        };

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.apply_env(|key| std::env::var(key).ok())?;

        Ok(config)
    }

    /// Override file values with `TELEGRAM_BOT_TOKEN`, `DEFAULT_CHANNEL`,
    /// `PROXY_ENABLED`, `PROXY_TYPE`, `PROXY_ADDRESS` and `PROXY_PORT`.
    pub fn apply_env<F>(&mut self, lookup: F) -> std::result::Result<(), IngestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(channel) = lookup("DEFAULT_CHANNEL") {
            self.telegram.channel = channel;
        }
        if let Some(enabled) = lookup("PROXY_ENABLED") {
            self.proxy.enabled = parse_flag(&enabled)?;
        }
        if let Some(kind) = lookup("PROXY_TYPE") {
            self.proxy.kind = Some(kind);
        }
        if let Some(address) = lookup("PROXY_ADDRESS") {
            self.proxy.address = Some(address);
        }
        if let Some(port) = lookup("PROXY_PORT") {
            let port = port.trim().parse::<u16>().map_err(|_| {
                IngestError::config(format!("PROXY_PORT '{}' is not a valid port", port))
            })?;
            self.proxy.port = Some(port);
        }
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), IngestError> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(IngestError::config(
                "telegram.bot_token (or TELEGRAM_BOT_TOKEN) is required",
            ));
        }
        if self.telegram.channel.trim().is_empty() {
            return Err(IngestError::config(
                "telegram.channel (or DEFAULT_CHANNEL) is required",
            ));
        }
        if self.ingest.media_workers == 0 {
            return Err(IngestError::config("ingest.media_workers must be at least 1"));
        }
        if self.ingest.queue_capacity == 0 {
            return Err(IngestError::config("ingest.queue_capacity must be at least 1"));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> std::result::Result<bool, IngestError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(IngestError::config(format!(
            "'{}' is not a boolean flag",
            other
        ))),
    }
}
