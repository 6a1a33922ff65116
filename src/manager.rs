//! Stream lifecycle and fan-out: a registry of processors keyed by stream
//! id, global callbacks inherited by new streams, and the shared publisher.

use crate::accel::AcceleratorSession;
use crate::config::DaemonConfig;
use crate::error::{PolicyError, Result};
use crate::ingest::IngestFactory;
use crate::processor::{ProcessorOptions, StreamProcessor};
use crate::publisher::{BusState, Publisher, PublisherStats};
use crate::types::{
    DetectionCallback, ErrorCallback, StateChangeCallback, StreamInfo, StreamStatus,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Default)]
struct GlobalCallbacks {
    detection: Option<DetectionCallback>,
    state_change: Option<StateChangeCallback>,
    error: Option<ErrorCallback>,
}

/// Owns every stream processor and the resources they share.
pub struct StreamManager {
    streams: tokio::sync::Mutex<HashMap<String, Arc<StreamProcessor>>>,
    publisher: Publisher,
    session: Arc<AcceleratorSession>,
    ingest_factory: Arc<dyn IngestFactory>,
    callbacks: Mutex<GlobalCallbacks>,
    options: ProcessorOptions,
    max_streams: usize,
    running: AtomicBool,
}

impl StreamManager {
    pub fn new(
        config: &DaemonConfig,
        session: Arc<AcceleratorSession>,
        ingest_factory: Arc<dyn IngestFactory>,
    ) -> Self {
        Self {
            streams: tokio::sync::Mutex::new(HashMap::new()),
            publisher: Publisher::new(&config.nats),
            session,
            ingest_factory,
            callbacks: Mutex::new(GlobalCallbacks::default()),
            options: ProcessorOptions::from_config(config),
            max_streams: config.performance.max_streams,
            running: AtomicBool::new(false),
        }
    }

    /// Bring the manager up. The bus connection is attempted but not
    /// required; it keeps retrying in the background.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stream manager starting");

        if let Err(e) = self.publisher.connect().await {
            warn!("Bus connection failed, will retry in background: {}", e);
        }

        info!("Stream manager started");
    }

    /// Stop every stream, then the publisher.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stream manager stopping");

        let streams: Vec<Arc<StreamProcessor>> = {
            let mut map = self.streams.lock().await;
            map.drain().map(|(_, processor)| processor).collect()
        };
        for processor in streams {
            processor.stop().await;
        }

        self.publisher.disconnect().await;
        info!("Stream manager stopped");
    }

    // ========================================================================
    // Stream lifecycle
    // ========================================================================

    /// Register and start a new stream. Policy violations (duplicate id,
    /// capacity) fail before any state changes.
    pub async fn add_stream(&self, info: StreamInfo) -> Result<()> {
        let mut streams = self.streams.lock().await;

        if streams.contains_key(&info.stream_id) {
            return Err(PolicyError::DuplicateStream {
                stream_id: info.stream_id,
            }
            .into());
        }
        if streams.len() >= self.max_streams {
            return Err(PolicyError::CapacityExceeded {
                max: self.max_streams,
            }
            .into());
        }

        let stream_id = info.stream_id.clone();
        let processor = Arc::new(StreamProcessor::create(
            info,
            Arc::clone(&self.session),
            Arc::clone(&self.ingest_factory),
            self.publisher.clone(),
            self.options.clone(),
        )?);

        self.apply_callbacks(&processor);
        processor.start().await?;

        streams.insert(stream_id.clone(), processor);
        info!("Stream added: {}", stream_id);
        Ok(())
    }

    /// Stop and discard a stream.
    pub async fn remove_stream(&self, stream_id: &str) -> Result<()> {
        let processor = {
            let mut streams = self.streams.lock().await;
            streams
                .remove(stream_id)
                .ok_or_else(|| PolicyError::UnknownStream {
                    stream_id: stream_id.to_string(),
                })?
        };

        processor.stop().await;
        info!("Stream removed: {}", stream_id);
        Ok(())
    }

    /// Replace a stream's configuration; the processor restarts with it.
    pub async fn update_stream(&self, info: StreamInfo) -> Result<()> {
        let processor = self.get_processor(&info.stream_id).await?;
        processor.update(info).await?;
        Ok(())
    }

    /// Put a stream into video-only mode, keeping ingest alive.
    pub async fn clear_stream_inference(&self, stream_id: &str) -> Result<()> {
        let processor = self.get_processor(stream_id).await?;
        processor.clear_inference().await?;
        info!("Inference cleared from stream: {}", stream_id);
        Ok(())
    }

    // ========================================================================
    // Event settings
    // ========================================================================

    pub async fn update_event_settings(
        &self,
        stream_id: &str,
        settings_json: &str,
    ) -> Result<Vec<String>> {
        let processor = self.get_processor(stream_id).await?;
        let terminals = processor.update_event_settings(settings_json)?;
        info!("Event settings updated for stream: {}", stream_id);
        Ok(terminals)
    }

    pub async fn clear_event_settings(&self, stream_id: &str) -> Result<()> {
        let processor = self.get_processor(stream_id).await?;
        processor.clear_event_settings();
        info!("Event settings cleared for stream: {}", stream_id);
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_stream_status(&self, stream_id: &str) -> Option<StreamStatus> {
        self.streams
            .lock()
            .await
            .get(stream_id)
            .map(|p| p.get_status())
    }

    pub async fn get_all_stream_status(&self) -> Vec<StreamStatus> {
        self.streams
            .lock()
            .await
            .values()
            .map(|p| p.get_status())
            .collect()
    }

    pub async fn get_snapshot(&self, stream_id: &str) -> Option<Bytes> {
        self.streams
            .lock()
            .await
            .get(stream_id)
            .and_then(|p| p.get_snapshot())
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    pub async fn has_stream(&self, stream_id: &str) -> bool {
        self.streams.lock().await.contains_key(stream_id)
    }

    // ========================================================================
    // Bus control
    // ========================================================================

    pub async fn connect_bus(&self) -> Result<()> {
        Ok(self.publisher.connect().await?)
    }

    pub async fn disconnect_bus(&self) {
        self.publisher.disconnect().await;
    }

    pub async fn reconnect_bus(&self) -> Result<()> {
        self.publisher.disconnect().await;
        Ok(self.publisher.connect().await?)
    }

    pub fn is_bus_connected(&self) -> bool {
        self.publisher.is_connected()
    }

    pub fn bus_state(&self) -> BusState {
        self.publisher.state()
    }

    pub fn bus_stats(&self) -> PublisherStats {
        self.publisher.stats()
    }

    pub fn bus_url(&self) -> String {
        self.publisher.url()
    }

    // ========================================================================
    // Global callbacks
    // ========================================================================

    pub async fn set_global_detection_callback(&self, callback: DetectionCallback) {
        self.callbacks.lock().unwrap().detection = Some(callback.clone());
        for processor in self.streams.lock().await.values() {
            processor.set_detection_callback(callback.clone());
        }
    }

    pub async fn set_global_state_change_callback(&self, callback: StateChangeCallback) {
        self.callbacks.lock().unwrap().state_change = Some(callback.clone());
        for processor in self.streams.lock().await.values() {
            processor.set_state_change_callback(callback.clone());
        }
    }

    pub async fn set_global_error_callback(&self, callback: ErrorCallback) {
        self.callbacks.lock().unwrap().error = Some(callback.clone());
        for processor in self.streams.lock().await.values() {
            processor.set_error_callback(callback.clone());
        }
    }

    /// Newly added processors inherit the current callback set.
    fn apply_callbacks(&self, processor: &StreamProcessor) {
        let callbacks = self.callbacks.lock().unwrap();
        if let Some(cb) = &callbacks.detection {
            processor.set_detection_callback(cb.clone());
        }
        if let Some(cb) = &callbacks.state_change {
            processor.set_state_change_callback(cb.clone());
        }
        if let Some(cb) = &callbacks.error {
            processor.set_error_callback(cb.clone());
        }
    }

    async fn get_processor(&self, stream_id: &str) -> Result<Arc<StreamProcessor>> {
        self.streams
            .lock()
            .await
            .get(stream_id)
            .cloned()
            .ok_or_else(|| {
                PolicyError::UnknownStream {
                    stream_id: stream_id.to_string(),
                }
                .into()
            })
    }
}
