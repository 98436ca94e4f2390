//! Configuration for the telemetry grid
//!
//! Configuration can be loaded from a TOML file and/or environment variables.
//! It is read once at startup; there is no runtime reload.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the telemetry grid
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sensor ingest configuration
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Time grid and frame log configuration
    #[serde(default)]
    pub grid: GridConfig,

    /// Subscriber streaming configuration
    #[serde(default)]
    pub stream: StreamConfig,
}

/// One sensor source bound to its own UDP port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name, used as the column prefix in frames
    pub name: String,

    /// UDP port the channel listens on (0 picks an ephemeral port)
    pub port: u16,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

/// Sensor ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Host to bind the channel sockets to
    #[serde(default = "default_host")]
    pub host: String,

    /// Receive buffer per datagram in bytes
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer_bytes: usize,

    /// Payload field naming the sender, dropped before flattening.
    /// An empty string disables the removal.
    #[serde(default = "default_identity_field")]
    pub identity_field: Option<String>,

    /// Configured channels, in frame column order
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_recv_buffer() -> usize {
    4096
}

fn default_identity_field() -> Option<String> {
    Some("node".to_string())
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig::new("front_imu", 6666),
        ChannelConfig::new("rear_brake_gps", 5555),
        ChannelConfig::new("front_tyre", 3333),
        ChannelConfig::new("brakes_imu", 7777),
        ChannelConfig::new("front_brakes_tps", 4444),
        ChannelConfig::new("primary_imu", 2222),
        ChannelConfig::new("rear_tyre", 1111),
    ]
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            recv_buffer_bytes: default_recv_buffer(),
            identity_field: default_identity_field(),
            channels: default_channels(),
        }
    }
}

impl IngestConfig {
    /// Identity field to strip, if enabled
    pub fn identity_field(&self) -> Option<&str> {
        self.identity_field.as_deref().filter(|f| !f.is_empty())
    }
}

/// Time grid and frame log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Grid step in milliseconds
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,

    /// Append-only frame log (one JSON object per line)
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    /// Emit a diagnostics summary every this many frames
    #[serde(default = "default_stats_every")]
    pub stats_every_frames: u64,
}

fn default_frame_interval() -> u64 {
    20 // 50 Hz
}

fn default_log_path() -> PathBuf {
    PathBuf::from("sensor_frames_flat.jsonl")
}

fn default_stats_every() -> u64 {
    100
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: default_frame_interval(),
            log_path: default_log_path(),
            stats_every_frames: default_stats_every(),
        }
    }
}

impl GridConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// Subscriber streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Serve SUBSCRIBE/UNSUBSCRIBE and stream frames
    #[serde(default = "default_stream_enabled")]
    pub enabled: bool,

    /// Host to bind the stream socket to
    #[serde(default = "default_host")]
    pub host: String,

    /// Stream port, shared by control ingress and frame egress
    #[serde(default = "default_stream_port")]
    pub port: u16,

    /// Maximum number of concurrent subscribers
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,

    /// Drop subscribers that have not re-sent SUBSCRIBE within this many
    /// seconds. Unset keeps subscribers until they unsubscribe.
    #[serde(default)]
    pub subscriber_ttl_secs: Option<u64>,

    /// Addresses that receive every frame without subscribing
    #[serde(default)]
    pub static_targets: Vec<SocketAddr>,
}

fn default_stream_enabled() -> bool {
    true
}

fn default_stream_port() -> u16 {
    9100
}

fn default_max_subscribers() -> usize {
    5
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: default_stream_enabled(),
            host: default_host(),
            port: default_stream_port(),
            max_subscribers: default_max_subscribers(),
            subscriber_ttl_secs: None,
            static_targets: Vec::new(),
        }
    }
}

impl StreamConfig {
    pub fn subscriber_ttl(&self) -> Option<Duration> {
        self.subscriber_ttl_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        // Ingest
        if let Ok(host) = std::env::var("TELEMETRY_HOST") {
            config.ingest.host = host.clone();
            config.stream.host = host;
        }
        if let Ok(list) = std::env::var("TELEMETRY_CHANNELS") {
            match parse_channel_list(&list) {
                Ok(channels) => config.ingest.channels = channels,
                Err(e) => tracing::warn!("Ignoring TELEMETRY_CHANNELS: {}", e),
            }
        }

        // Grid
        if let Ok(ms) = std::env::var("TELEMETRY_FRAME_INTERVAL_MS") {
            if let Ok(m) = ms.parse() {
                config.grid.frame_interval_ms = m;
            }
        }
        if let Ok(path) = std::env::var("TELEMETRY_LOG_PATH") {
            config.grid.log_path = PathBuf::from(path);
        }
        if let Ok(every) = std::env::var("TELEMETRY_STATS_EVERY") {
            if let Ok(e) = every.parse() {
                config.grid.stats_every_frames = e;
            }
        }

        // Stream
        if let Ok(enabled) = std::env::var("TELEMETRY_STREAM_ENABLED") {
            if let Ok(e) = enabled.parse() {
                config.stream.enabled = e;
            }
        }
        if let Ok(port) = std::env::var("TELEMETRY_STREAM_PORT") {
            if let Ok(p) = port.parse() {
                config.stream.port = p;
            }
        }
        if let Ok(max) = std::env::var("TELEMETRY_MAX_SUBSCRIBERS") {
            if let Ok(m) = max.parse() {
                config.stream.max_subscribers = m;
            }
        }
        if let Ok(ttl) = std::env::var("TELEMETRY_SUBSCRIBER_TTL_SECS") {
            if let Ok(t) = ttl.parse() {
                config.stream.subscriber_ttl_secs = Some(t);
            }
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
            tracing::warn!(
                "Config file {} not found, using environment",
                p.as_ref().display()
            );
        }
        Ok(Self::from_env())
    }

    /// Check the configuration for values the grid cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.channels.is_empty() {
            return Err(ConfigError::Invalid("no channels configured".into()));
        }
        if self.ingest.recv_buffer_bytes == 0 {
            return Err(ConfigError::Invalid("recv_buffer_bytes must be > 0".into()));
        }
        if self.grid.frame_interval_ms == 0 {
            return Err(ConfigError::Invalid("frame_interval_ms must be > 0".into()));
        }
        if self.grid.stats_every_frames == 0 {
            return Err(ConfigError::Invalid("stats_every_frames must be > 0".into()));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for channel in &self.ingest.channels {
            if channel.name.is_empty() {
                return Err(ConfigError::Invalid("channel name must not be empty".into()));
            }
            if !names.insert(channel.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
            // Port 0 asks the OS for an ephemeral port, so it never collides
            if channel.port != 0 && !ports.insert(channel.port) {
                return Err(ConfigError::Invalid(format!(
                    "port {} used by more than one channel",
                    channel.port
                )));
            }
        }

        if self.stream.enabled && self.stream.port != 0 && ports.contains(&self.stream.port) {
            return Err(ConfigError::Invalid(format!(
                "stream port {} is also an ingest port",
                self.stream.port
            )));
        }

        Ok(())
    }
}

/// Parse a `name:port,name:port` channel list
pub fn parse_channel_list(list: &str) -> Result<Vec<ChannelConfig>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, port) = entry
                .rsplit_once(':')
                .ok_or_else(|| ConfigError::Parse(format!("expected name:port, got '{}'", entry)))?;
            let port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Parse(format!("invalid port in '{}'", entry)))?;
            Ok(ChannelConfig::new(name.trim(), port))
        })
        .collect()
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
