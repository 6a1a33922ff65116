//! Per-stream processing: a state machine driving the ingest pipeline into
//! the inference layer, evaluating events, and publishing per-frame
//! envelopes.

use crate::accel::AcceleratorSession;
use crate::config::DaemonConfig;
use crate::error::{EdgewatchError, PolicyError, Result};
use crate::events::EventCompositor;
use crate::inference::batch::BatchCoordinator;
use crate::inference::InferenceEngine;
use crate::ingest::{
    IngestConfig, IngestEvent, IngestFactory, IngestPipeline, RawFrame, FRAME_CHANNEL_CAPACITY,
};
use crate::publisher::Publisher;
use crate::types::{
    now_ms, DetectionCallback, DetectionEvent, ErrorCallback, StateChangeCallback, StreamInfo,
    StreamState, StreamStatus,
};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reconnect attempts before a stream parks in the Error state.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Base reconnect delay; attempt `n` waits `n` times this.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// A live source that goes quiet this long counts as failed.
pub const INGEST_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before the next reconnect attempt.
pub fn reconnect_delay(attempt: u32) -> Duration {
    RECONNECT_DELAY * attempt
}

/// Processor tunables lifted from the daemon configuration.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub jpeg_quality: u8,
    pub publish_images: bool,
    pub batch_timeout: Duration,
    pub rtsp_latency_ms: u32,
    pub rtsp_timeout_us: u64,
    pub rtsp_retry: u32,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            publish_images: false,
            batch_timeout: Duration::from_millis(50),
            rtsp_latency_ms: 0,
            rtsp_timeout_us: 10_000_000,
            rtsp_retry: 3,
        }
    }
}

impl ProcessorOptions {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            jpeg_quality: config.snapshot.jpeg_quality,
            publish_images: config.snapshot.publish_images,
            batch_timeout: Duration::from_millis(config.performance.batch_timeout_ms),
            rtsp_latency_ms: config.performance.rtsp_latency_ms,
            rtsp_timeout_us: config.performance.rtsp_timeout_us,
            rtsp_retry: config.performance.rtsp_retry,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    detection: Option<DetectionCallback>,
    state_change: Option<StateChangeCallback>,
    error: Option<ErrorCallback>,
}

struct Shared {
    info: Mutex<StreamInfo>,
    state: Mutex<StreamState>,
    callbacks: Mutex<Callbacks>,
    last_error: Mutex<String>,
    snapshot: Mutex<Option<Bytes>>,
    frame_count: AtomicU64,
    current_fps_bits: AtomicU64,
    last_detection_time: AtomicI64,
    start_time: Mutex<Option<Instant>>,
    reconnect_attempts: AtomicU32,
    /// Bumped by stop/update; stale frame loops and reconnect timers check
    /// it and bow out.
    generation: AtomicU64,
    engine: Mutex<Option<Arc<InferenceEngine>>>,
    coordinator: Mutex<Option<Arc<BatchCoordinator>>>,
    compositor: EventCompositor,
    session: Arc<AcceleratorSession>,
    ingest_factory: Arc<dyn IngestFactory>,
    publisher: Publisher,
    options: ProcessorOptions,
    pipeline: Mutex<Option<Box<dyn IngestPipeline>>>,
    frame_task: Mutex<Option<JoinHandle<()>>>,
}

/// One managed stream: ingest, inference, event evaluation, publication,
/// and the last-snapshot slot.
pub struct StreamProcessor {
    shared: Arc<Shared>,
}

impl StreamProcessor {
    pub fn create(
        info: StreamInfo,
        session: Arc<AcceleratorSession>,
        ingest_factory: Arc<dyn IngestFactory>,
        publisher: Publisher,
        options: ProcessorOptions,
    ) -> Result<Self> {
        if info.stream_id.is_empty() {
            return Err(PolicyError::EmptyStreamId.into());
        }
        if info.rtsp_url.is_empty() {
            return Err(PolicyError::EmptyRtspUrl.into());
        }

        Ok(Self {
            shared: Arc::new(Shared {
                info: Mutex::new(info),
                state: Mutex::new(StreamState::Stopped),
                callbacks: Mutex::new(Callbacks::default()),
                last_error: Mutex::new(String::new()),
                snapshot: Mutex::new(None),
                frame_count: AtomicU64::new(0),
                current_fps_bits: AtomicU64::new(0f64.to_bits()),
                last_detection_time: AtomicI64::new(0),
                start_time: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                engine: Mutex::new(None),
                coordinator: Mutex::new(None),
                compositor: EventCompositor::new(),
                session,
                ingest_factory,
                publisher,
                options,
                pipeline: Mutex::new(None),
                frame_task: Mutex::new(None),
            }),
        })
    }

    pub fn stream_id(&self) -> String {
        self.shared.info.lock().unwrap().stream_id.clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring the stream up: acquire the model's engine (when configured),
    /// start the ingest pipeline, and wait for frames. The state moves to
    /// Running on the first delivered frame.
    pub async fn start(&self) -> Result<()> {
        {
            let state = *self.shared.state.lock().unwrap();
            if state == StreamState::Running || state == StreamState::Starting {
                return Ok(());
            }
        }

        let stream_id = self.stream_id();
        set_state(&self.shared, StreamState::Starting);
        info!("Starting stream: {}", stream_id);

        if let Err(e) = acquire_inference(&self.shared) {
            set_error(&self.shared, &e.to_string());
            set_state(&self.shared, StreamState::Error);
            return Err(e);
        }

        self.shared.frame_count.store(0, Ordering::SeqCst);
        self.shared.reconnect_attempts.store(0, Ordering::SeqCst);
        *self.shared.start_time.lock().unwrap() = Some(Instant::now());

        if let Err(e) = spawn_pipeline(&self.shared) {
            set_error(&self.shared, &e.to_string());
            set_state(&self.shared, StreamState::Error);
            return Err(e);
        }

        info!("Stream started: {}", stream_id);
        Ok(())
    }

    /// Tear the stream down: ingest pipeline first (frames cancel at the
    /// source), then the frame loop, then the engine reference. In-flight
    /// inference completes; nothing is aborted.
    pub async fn stop(&self) {
        {
            let state = *self.shared.state.lock().unwrap();
            if state == StreamState::Stopped {
                return;
            }
        }

        let stream_id = self.stream_id();
        info!("Stopping stream: {}", stream_id);

        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        stop_pipeline(&self.shared);

        let task = self.shared.frame_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        *self.shared.engine.lock().unwrap() = None;
        *self.shared.coordinator.lock().unwrap() = None;

        set_state(&self.shared, StreamState::Stopped);
        info!("Stream stopped: {}", stream_id);
    }

    /// Replace the stream's identity and restart. Empty model fields keep
    /// their current values.
    pub async fn update(&self, new_info: StreamInfo) -> Result<()> {
        info!("Updating stream: {}", self.stream_id());
        self.stop().await;

        {
            let mut info = self.shared.info.lock().unwrap();
            info.rtsp_url = new_info.rtsp_url;
            if !new_info.hef_path.is_empty() {
                info.hef_path = new_info.hef_path;
            }
            if !new_info.model_id.is_empty() {
                info.model_id = new_info.model_id;
            }
            info.task = new_info.task;
            info.num_keypoints = new_info.num_keypoints;
            if !new_info.labels.is_empty() {
                info.labels = new_info.labels;
            }
            info.config = new_info.config;
        }

        self.start().await
    }

    /// Drop inference from this stream and restart in video-only mode.
    pub async fn clear_inference(&self) -> Result<()> {
        info!("Clearing inference from stream: {}", self.stream_id());
        self.stop().await;

        {
            let mut info = self.shared.info.lock().unwrap();
            info.hef_path.clear();
            info.model_id.clear();
        }

        self.start().await
    }

    // ========================================================================
    // Event settings
    // ========================================================================

    pub fn update_event_settings(&self, settings_json: &str) -> Result<Vec<String>> {
        Ok(self.shared.compositor.update_settings(settings_json)?)
    }

    pub fn clear_event_settings(&self) {
        self.shared.compositor.clear_settings();
    }

    // ========================================================================
    // Status, snapshot, callbacks
    // ========================================================================

    pub fn get_status(&self) -> StreamStatus {
        let info = self.shared.info.lock().unwrap();
        let state = *self.shared.state.lock().unwrap();

        let uptime_seconds = match state {
            StreamState::Running | StreamState::Reconnecting => self
                .shared
                .start_time
                .lock()
                .unwrap()
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            _ => 0,
        };

        StreamStatus {
            stream_id: info.stream_id.clone(),
            rtsp_url: info.rtsp_url.clone(),
            model_id: info.model_id.clone(),
            state,
            frame_count: self.shared.frame_count.load(Ordering::SeqCst),
            current_fps: f64::from_bits(self.shared.current_fps_bits.load(Ordering::SeqCst)),
            uptime_seconds,
            last_error: self.shared.last_error.lock().unwrap().clone(),
            last_detection_time: self.shared.last_detection_time.load(Ordering::SeqCst),
        }
    }

    /// The most recent encoded frame, if any frame was captured yet.
    pub fn get_snapshot(&self) -> Option<Bytes> {
        self.shared.snapshot.lock().unwrap().clone()
    }

    pub fn set_detection_callback(&self, callback: DetectionCallback) {
        self.shared.callbacks.lock().unwrap().detection = Some(callback);
    }

    pub fn set_state_change_callback(&self, callback: StateChangeCallback) {
        self.shared.callbacks.lock().unwrap().state_change = Some(callback);
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        self.shared.callbacks.lock().unwrap().error = Some(callback);
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        stop_pipeline(&self.shared);
    }
}

// ============================================================================
// Pipeline wiring
// ============================================================================

/// Acquire the shared engine for the stream's model, when one is set.
fn acquire_inference(shared: &Arc<Shared>) -> Result<()> {
    let (hef_path, task, num_keypoints, labels, threshold) = {
        let info = shared.info.lock().unwrap();
        (
            info.hef_path.clone(),
            info.task,
            info.num_keypoints,
            info.labels.clone(),
            info.config.confidence_threshold,
        )
    };

    if hef_path.is_empty() {
        debug!("Video-only stream, no inference");
        *shared.engine.lock().unwrap() = None;
        *shared.coordinator.lock().unwrap() = None;
        return Ok(());
    }

    let engine = shared
        .session
        .acquire_engine(&hef_path)
        .map_err(EdgewatchError::from)?;
    engine.set_model_config(task, num_keypoints, labels);

    let coordinator = shared
        .session
        .batch_coordinator(&hef_path, shared.options.batch_timeout);
    if let Some(coordinator) = &coordinator {
        coordinator.set_confidence_threshold(threshold);
    }

    *shared.engine.lock().unwrap() = Some(engine);
    *shared.coordinator.lock().unwrap() = coordinator;
    Ok(())
}

/// Start the ingest pipeline and its consuming frame loop.
fn spawn_pipeline(shared: &Arc<Shared>) -> Result<()> {
    let ingest_config = {
        let info = shared.info.lock().unwrap();
        IngestConfig {
            rtsp_url: info.rtsp_url.clone(),
            latency_ms: shared.options.rtsp_latency_ms,
            timeout_us: shared.options.rtsp_timeout_us,
            retry: shared.options.rtsp_retry,
        }
    };

    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let pipeline = shared
        .ingest_factory
        .spawn(&ingest_config, tx)
        .map_err(EdgewatchError::from)?;

    stop_pipeline(shared);
    *shared.pipeline.lock().unwrap() = Some(pipeline);

    let generation = shared.generation.load(Ordering::SeqCst);
    let loop_shared = Arc::clone(shared);
    let task = tokio::spawn(frame_loop(loop_shared, rx, generation));
    *shared.frame_task.lock().unwrap() = Some(task);

    Ok(())
}

fn stop_pipeline(shared: &Arc<Shared>) {
    if let Some(mut pipeline) = shared.pipeline.lock().unwrap().take() {
        pipeline.stop();
    }
}

struct FpsEstimator {
    last_update: Instant,
    frames: u32,
}

impl FpsEstimator {
    fn new() -> Self {
        Self {
            last_update: Instant::now(),
            frames: 0,
        }
    }

    /// Count a frame; returns the refreshed rate once per second.
    fn tick(&mut self) -> Option<f64> {
        self.frames += 1;
        let elapsed = self.last_update.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let fps = self.frames as f64 / elapsed.as_secs_f64();
            self.frames = 0;
            self.last_update = Instant::now();
            Some(fps)
        } else {
            None
        }
    }
}

async fn frame_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<IngestEvent>, generation: u64) {
    let mut fps = FpsEstimator::new();

    let failure: String = loop {
        let event = tokio::time::timeout(INGEST_INACTIVITY_TIMEOUT, rx.recv()).await;

        if shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        match event {
            Ok(Some(IngestEvent::Frame(frame))) => {
                {
                    let state = *shared.state.lock().unwrap();
                    if state == StreamState::Starting || state == StreamState::Reconnecting {
                        info!(
                            "Stream {} resolution: {}x{}",
                            shared.info.lock().unwrap().stream_id,
                            frame.width,
                            frame.height
                        );
                        set_state(&shared, StreamState::Running);
                        shared.reconnect_attempts.store(0, Ordering::SeqCst);
                    }
                }
                on_frame(&shared, frame, &mut fps).await;
            }
            Ok(Some(IngestEvent::EndOfStream)) => break "ingest reached end of stream".to_string(),
            Ok(Some(IngestEvent::Error(e))) => break e,
            Ok(None) => break "ingest pipeline closed unexpectedly".to_string(),
            Err(_) => {
                break format!(
                    "no frames for {} seconds",
                    INGEST_INACTIVITY_TIMEOUT.as_secs()
                )
            }
        }
    };

    if shared.generation.load(Ordering::SeqCst) != generation {
        return;
    }

    set_error(&shared, &failure);
    stop_pipeline(&shared);
    schedule_reconnect(&shared);
}

/// Per-frame path: inference (direct or batched), snapshot encode, event
/// evaluation, envelope assembly, publication, callback.
async fn on_frame(shared: &Arc<Shared>, frame: RawFrame, fps: &mut FpsEstimator) {
    if !frame.validate_size() {
        warn!(
            "Dropping malformed frame: {} bytes for {}x{}",
            frame.data.len(),
            frame.width,
            frame.height
        );
        return;
    }

    let frame_number = shared.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(rate) = fps.tick() {
        shared.current_fps_bits.store(rate.to_bits(), Ordering::SeqCst);
    }

    let (stream_id, threshold) = {
        let info = shared.info.lock().unwrap();
        (info.stream_id.clone(), info.config.confidence_threshold)
    };

    // Inference: batched when the model batches, direct otherwise.
    let engine = shared.engine.lock().unwrap().clone();
    let coordinator = shared.coordinator.lock().unwrap().clone();
    let mut detections = match (engine, coordinator) {
        (Some(_), Some(coordinator)) => {
            let (tx, rx) = tokio::sync::oneshot::channel();
            coordinator.submit_frame(
                &stream_id,
                frame.data.clone(),
                frame.width,
                frame.height,
                Box::new(move |detections| {
                    let _ = tx.send(detections);
                }),
            );
            rx.await.unwrap_or_default()
        }
        (Some(engine), None) => {
            let data = frame.data.clone();
            let (width, height) = (frame.width, frame.height);
            tokio::task::spawn_blocking(move || {
                engine.run_inference(&data, width, height, threshold)
            })
            .await
            .unwrap_or_default()
        }
        _ => Vec::new(),
    };

    // Snapshot: encode once, keep for preview and (optionally) the envelope.
    let jpeg = {
        let data = frame.data.clone();
        let (width, height) = (frame.width, frame.height);
        let quality = shared.options.jpeg_quality;
        tokio::task::spawn_blocking(move || encode_jpeg(&data, width, height, quality))
            .await
            .unwrap_or_else(|e| Err(EdgewatchError::component("snapshot", e.to_string())))
    };

    let jpeg = match jpeg {
        Ok(bytes) => {
            *shared.snapshot.lock().unwrap() = Some(bytes.clone());
            Some(bytes)
        }
        Err(e) => {
            warn!("Snapshot encode failed: {}", e);
            None
        }
    };

    // Event evaluation: region tagging plus line and angle statuses.
    shared
        .compositor
        .check_events(&mut detections, frame.width, frame.height);
    let mut events = shared.compositor.check_line_events(&detections);
    events.extend(shared.compositor.check_angle_violation_events(&detections));

    let timestamp = now_ms();
    if !detections.is_empty() {
        shared.last_detection_time.store(timestamp, Ordering::SeqCst);
    }

    let event = DetectionEvent {
        stream_id,
        timestamp,
        frame_number,
        fps: f64::from_bits(shared.current_fps_bits.load(Ordering::SeqCst)),
        width: frame.width as i32,
        height: frame.height as i32,
        detections,
        events,
        image_data: shared.options.publish_images.then(|| jpeg).flatten(),
    };

    shared.publisher.publish(&event).await;

    let callback = shared.callbacks.lock().unwrap().detection.clone();
    if let Some(callback) = callback {
        callback(&event);
    }
}

/// Encode packed RGB8 to JPEG at the given quality.
fn encode_jpeg(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Bytes> {
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder
        .encode(rgb, width, height, image::ColorType::Rgb8)
        .map_err(|e| EdgewatchError::component("snapshot", e.to_string()))?;
    Ok(Bytes::from(buffer))
}

// ============================================================================
// Reconnection
// ============================================================================

fn schedule_reconnect(shared: &Arc<Shared>) {
    {
        let state = *shared.state.lock().unwrap();
        if state == StreamState::Stopped {
            return;
        }
    }

    let attempt = shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt > MAX_RECONNECT_ATTEMPTS {
        set_error(shared, "Max reconnection attempts reached");
        set_state(shared, StreamState::Error);
        return;
    }

    set_state(shared, StreamState::Reconnecting);
    let delay = reconnect_delay(attempt);
    let stream_id = shared.info.lock().unwrap().stream_id.clone();
    warn!(
        "Scheduling reconnect for {} in {:?} (attempt {}/{})",
        stream_id, delay, attempt, MAX_RECONNECT_ATTEMPTS
    );

    let generation = shared.generation.load(Ordering::SeqCst);
    let timer_shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        if timer_shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        {
            let state = *timer_shared.state.lock().unwrap();
            if state != StreamState::Reconnecting {
                return;
            }
        }

        info!("Attempting reconnect for stream: {}", stream_id);
        set_state(&timer_shared, StreamState::Starting);

        if let Err(e) = spawn_pipeline(&timer_shared) {
            set_error(&timer_shared, &e.to_string());
            schedule_reconnect(&timer_shared);
        }
    });
}

// ============================================================================
// State bookkeeping
// ============================================================================

fn set_state(shared: &Arc<Shared>, new_state: StreamState) {
    let old_state = {
        let mut state = shared.state.lock().unwrap();
        std::mem::replace(&mut *state, new_state)
    };

    if old_state != new_state {
        let stream_id = shared.info.lock().unwrap().stream_id.clone();
        info!("Stream {} state: {} -> {}", stream_id, old_state, new_state);

        let callback = shared.callbacks.lock().unwrap().state_change.clone();
        if let Some(callback) = callback {
            callback(&stream_id, new_state);
        }
    }
}

fn set_error(shared: &Arc<Shared>, error: &str) {
    *shared.last_error.lock().unwrap() = error.to_string();

    let stream_id = shared.info.lock().unwrap().stream_id.clone();
    warn!("Stream {} error: {}", stream_id, error);

    let callback = shared.callbacks.lock().unwrap().error.clone();
    if let Some(callback) = callback {
        callback(&stream_id, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_progression() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(3));
        assert_eq!(reconnect_delay(4), Duration::from_secs(12));
        assert_eq!(reconnect_delay(10), Duration::from_secs(30));

        // The whole ladder adds up to 165 seconds before Error.
        let total: Duration = (1..=MAX_RECONNECT_ATTEMPTS).map(reconnect_delay).sum();
        assert_eq!(total, Duration::from_secs(165));
    }

    #[test]
    fn test_encode_jpeg_produces_jfif() {
        let rgb = vec![200u8; 16 * 16 * 3];
        let jpeg = encode_jpeg(&rgb, 16, 16, 80).unwrap();
        // JPEG SOI marker.
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn test_fps_estimator_rolls_up() {
        let mut fps = FpsEstimator::new();
        assert!(fps.tick().is_none());
        // Backdate the window and confirm the rate comes out.
        fps.last_update = Instant::now() - Duration::from_secs(2);
        let rate = fps.tick().unwrap();
        assert!(rate > 0.5 && rate < 1.5, "rate {rate}");
    }
}
