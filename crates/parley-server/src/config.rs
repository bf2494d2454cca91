//! Server configuration.
//!
//! Configuration is layered:
//! - the first existing TOML file among `$PARLEY_CONFIG`, `parley.toml`,
//!   `/etc/parley/parley.toml` and `~/.config/parley/parley.toml`
//! - environment variables such as `PARLEY__PORT=9000` or
//!   `PARLEY__LIMITS__MAX_CHANNELS=500`

use anyhow::{Context, Result};
use parley_service::{DirectoryEntry, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Conversation service tunables. Reloaded on `SIGHUP`.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Known users. Reloaded on `SIGHUP`.
    #[serde(default)]
    pub directory: DirectoryConfig,
}

/// Live transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Upper bound for a long-poll wait in milliseconds.
    #[serde(default = "default_longpoll_timeout")]
    pub longpoll_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of broker channels.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Maximum channels per live session.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_session: usize,

    /// Per-channel broadcast capacity.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Per-session delivery buffer.
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,

    /// Maximum message text size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path. `:memory:` keeps everything in memory.
    #[serde(default = "default_database_path")]
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub users: Vec<DirectoryEntry>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_longpoll_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_max_channels() -> usize {
    100_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_session_buffer() -> usize {
    256
}

fn default_max_message_size() -> usize {
    16 * 1024 // 16 KB
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_database_path() -> String {
    "parley.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            database: DatabaseConfig::default(),
            service: ServiceConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            longpoll_timeout_ms: default_longpoll_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_channels: default_max_channels(),
            max_subscriptions_per_session: default_max_subscriptions(),
            channel_capacity: default_channel_capacity(),
            session_buffer: default_session_buffer(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl DatabaseConfig {
    /// The expanded database file, or `None` for an in-memory database.
    #[must_use]
    pub fn file(&self) -> Option<PathBuf> {
        if self.path == ":memory:" {
            None
        } else {
            Some(PathBuf::from(shellexpand::tilde(&self.path).as_ref()))
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut candidates = Vec::new();
        if let Ok(path) = std::env::var("PARLEY_CONFIG") {
            candidates.push(path);
        }
        candidates.extend(
            [
                "parley.toml",
                "/etc/parley/parley.toml",
                "~/.config/parley/parley.toml",
            ]
            .map(String::from),
        );

        let file = candidates
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        Self::layered(file.as_deref())
    }

    /// Load configuration from a specific file, without environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            tracing::info!("Loading configuration from {}", path.display());
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
