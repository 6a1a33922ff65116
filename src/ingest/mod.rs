//! RTSP ingest contract.
//!
//! The daemon consumes raw RGB frames from an ingest collaborator through a
//! channel of [`IngestEvent`]s. The collaborator is swappable: a GStreamer
//! realization lives behind the `gst` feature, and a channel-driven mock
//! backs the tests.

use crate::error::IngestError;
use bytes::Bytes;
use tokio::sync::mpsc;

pub mod mock;

#[cfg(feature = "gst")]
pub mod gst;

/// Frame channel depth; ingest drops rather than buffers when the consumer
/// lags.
pub const FRAME_CHANNEL_CAPACITY: usize = 4;

/// Source parameters handed to the ingest collaborator.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub rtsp_url: String,
    pub latency_ms: u32,
    pub timeout_us: u64,
    pub retry: u32,
}

impl IngestConfig {
    pub fn new(rtsp_url: impl Into<String>) -> Self {
        Self {
            rtsp_url: rtsp_url.into(),
            latency_ms: 0,
            timeout_us: 10_000_000,
            retry: 3,
        }
    }
}

/// One decoded frame: packed RGB8, `data.len() == width * height * 3`.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Unix ms at capture.
    pub timestamp_ms: i64,
}

impl RawFrame {
    pub fn expected_len(&self) -> usize {
        (self.width * self.height * 3) as usize
    }

    pub fn validate_size(&self) -> bool {
        self.data.len() == self.expected_len()
    }
}

/// Lifecycle stream produced by an ingest pipeline.
#[derive(Debug, Clone)]
pub enum IngestEvent {
    /// A decoded frame; the first one doubles as "source is live".
    Frame(RawFrame),
    EndOfStream,
    Error(String),
}

/// Handle to a running ingest pipeline.
pub trait IngestPipeline: Send {
    /// Tear the pipeline down; pending frames are cancelled at the source.
    fn stop(&mut self);
}

/// Creates ingest pipelines; one per stream start or reconnect attempt.
pub trait IngestFactory: Send + Sync {
    fn spawn(
        &self,
        config: &IngestConfig,
        tx: mpsc::Sender<IngestEvent>,
    ) -> Result<Box<dyn IngestPipeline>, IngestError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_config_defaults() {
        let config = IngestConfig::new("rtsp://cam.local/stream");
        assert_eq!(config.latency_ms, 0);
        assert_eq!(config.timeout_us, 10_000_000);
        assert_eq!(config.retry, 3);
    }

    #[test]
    fn test_raw_frame_size_validation() {
        let frame = RawFrame {
            data: Bytes::from(vec![0u8; 4 * 2 * 3]),
            width: 4,
            height: 2,
            timestamp_ms: 0,
        };
        assert!(frame.validate_size());

        let bad = RawFrame {
            data: Bytes::from(vec![0u8; 5]),
            width: 4,
            height: 2,
            timestamp_ms: 0,
        };
        assert!(!bad.validate_size());
    }
}
