use crate::error::{EdgewatchError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Complete daemon configuration, loaded from a TOML file with environment
/// overrides (`EDGEWATCH_NATS__URL=... edgewatch`).
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub stream: StreamDefaults,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Message bus connection settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NatsConfig {
    /// Bus server URL
    #[serde(default = "default_nats_url")]
    pub url: String,

    /// Keep retrying the connection in the background
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Seconds between background reconnect attempts
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_seconds: u64,

    /// Connection attempt timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

/// Defaults applied to streams that do not specify their own tuning.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamDefaults {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Minimum confidence for emitted detections
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

/// Ingest and scheduling limits.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PerformanceConfig {
    /// Maximum number of concurrently managed streams
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,

    /// RTSP source latency in milliseconds
    #[serde(default)]
    pub rtsp_latency_ms: u32,

    /// RTSP source timeout in microseconds
    #[serde(default = "default_rtsp_timeout_us")]
    pub rtsp_timeout_us: u64,

    /// RTSP source retry count
    #[serde(default = "default_rtsp_retry")]
    pub rtsp_retry: u32,

    /// Batch collection window in milliseconds for batching-capable models
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
}

/// Snapshot encoding and image publishing.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SnapshotConfig {
    /// JPEG quality, 1-100
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Include the encoded frame in every published envelope
    #[serde(default)]
    pub publish_images: bool,
}

/// Logging output settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: json, pretty, or compact
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_fps() -> u32 {
    30
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_max_streams() -> usize {
    4
}

fn default_rtsp_timeout_us() -> u64 {
    10_000_000
}

fn default_rtsp_retry() -> u32 {
    3
}

fn default_batch_timeout_ms() -> u64 {
    50
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            auto_reconnect: true,
            reconnect_interval_seconds: default_reconnect_interval(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_streams: default_max_streams(),
            rtsp_latency_ms: 0,
            rtsp_timeout_us: default_rtsp_timeout_us(),
            rtsp_retry: default_rtsp_retry(),
            batch_timeout_ms: default_batch_timeout_ms(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            publish_images: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file plus `EDGEWATCH_*` environment
    /// variables; missing file falls back to defaults with a warning left
    /// to the caller.
    pub fn load(path: &str) -> Result<Self> {
        debug!("Loading configuration from {}", path);

        let mut builder = Config::builder();

        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path));
        }

        let settings = builder
            .add_source(Environment::with_prefix("EDGEWATCH").separator("__"))
            .build()?;

        let config: DaemonConfig = settings.try_deserialize()?;
        config.validate()?;

        info!("Configuration loaded from {}", path);
        Ok(config)
    }

    /// Render the default configuration as TOML, for `--print-config`.
    pub fn default_toml() -> Result<String> {
        Ok(toml::to_string_pretty(&DaemonConfig::default())?)
    }

    /// Check value ranges before anything is constructed from this config.
    pub fn validate(&self) -> Result<()> {
        if self.performance.max_streams == 0 {
            return Err(EdgewatchError::component(
                "config",
                "performance.max_streams must be at least 1",
            ));
        }

        if !(0.0..=1.0).contains(&self.stream.confidence_threshold) {
            return Err(EdgewatchError::component(
                "config",
                format!(
                    "stream.confidence_threshold must be within [0, 1], got {}",
                    self.stream.confidence_threshold
                ),
            ));
        }

        if self.snapshot.jpeg_quality == 0 || self.snapshot.jpeg_quality > 100 {
            return Err(EdgewatchError::component(
                "config",
                format!(
                    "snapshot.jpeg_quality must be within 1..=100, got {}",
                    self.snapshot.jpeg_quality
                ),
            ));
        }

        if self.nats.url.is_empty() {
            return Err(EdgewatchError::component("config", "nats.url cannot be empty"));
        }

        Ok(())
    }
}
