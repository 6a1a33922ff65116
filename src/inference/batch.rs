//! Cross-stream batch collection for batching-capable models.
//!
//! One coordinator runs per batching engine. Submitted frames queue up; a
//! worker thread pops the head frame, waits out the batch window measured
//! from that frame's submit time, runs one batched inference, and fans the
//! results back out through per-frame callbacks in submission order.

use crate::inference::{BatchFrame, InferenceEngine};
use crate::types::Detection;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default window for collecting a batch, measured from the head frame's
/// submission.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(50);

const QUEUE_CAPACITY: usize = 64;
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Executes one batched inference. The coordinator only needs this much of
/// an engine, which keeps it testable and keeps ownership one-directional.
pub trait BatchRunner: Send + Sync {
    fn batch_size(&self) -> usize;

    fn run_batch(
        &self,
        frames: &[BatchFrame],
        confidence_threshold: f32,
    ) -> HashMap<String, Vec<Detection>>;
}

/// Non-owning runner over an engine: the registry is the single strong
/// owner; a strong reference is taken only for the duration of one batch.
pub struct EngineBatchRunner {
    engine: Weak<InferenceEngine>,
}

impl EngineBatchRunner {
    pub fn new(engine: &Arc<InferenceEngine>) -> Self {
        Self {
            engine: Arc::downgrade(engine),
        }
    }
}

impl BatchRunner for EngineBatchRunner {
    fn batch_size(&self) -> usize {
        self.engine.upgrade().map(|e| e.batch_size()).unwrap_or(1)
    }

    fn run_batch(
        &self,
        frames: &[BatchFrame],
        confidence_threshold: f32,
    ) -> HashMap<String, Vec<Detection>> {
        match self.engine.upgrade() {
            Some(engine) => engine.run_batch_inference(frames, confidence_threshold),
            None => {
                warn!("Batch runner lost its engine, dropping {} frames", frames.len());
                HashMap::new()
            }
        }
    }
}

/// Invoked once per submitted frame with that frame's decoded detections
/// (empty when the stream had no entry in the batch result).
pub type BatchCallback = Box<dyn FnOnce(Vec<Detection>) + Send>;

struct PendingFrame {
    frame: BatchFrame,
    callback: BatchCallback,
    submitted: Instant,
}

/// Collects frames from multiple streams into device batches.
pub struct BatchCoordinator {
    tx: Sender<PendingFrame>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    batch_size: usize,
    confidence_threshold: Arc<AtomicU32>,
}

impl BatchCoordinator {
    /// Start a coordinator and its worker thread.
    pub fn new(runner: Arc<dyn BatchRunner>, batch_timeout: Duration) -> Arc<Self> {
        let batch_size = runner.batch_size().max(1);
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let confidence_threshold = Arc::new(AtomicU32::new(0.25f32.to_bits()));

        let worker_running = Arc::clone(&running);
        let worker_threshold = Arc::clone(&confidence_threshold);
        let worker = std::thread::Builder::new()
            .name("batch-coordinator".to_string())
            .spawn(move || {
                worker_loop(
                    rx,
                    runner,
                    worker_running,
                    batch_size,
                    batch_timeout,
                    worker_threshold,
                );
            })
            .expect("failed to spawn batch coordinator worker");

        info!(
            "Batch coordinator started: batch_size={}, timeout={:?}",
            batch_size, batch_timeout
        );
        Arc::new(Self {
            tx,
            running,
            worker: Mutex::new(Some(worker)),
            batch_size,
            confidence_threshold,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Confidence floor applied to every batch this coordinator runs.
    pub fn set_confidence_threshold(&self, threshold: f32) {
        self.confidence_threshold
            .store(threshold.to_bits(), Ordering::Relaxed);
    }

    /// Queue one frame. The RGB bytes are shared, not copied again; the
    /// callback fires from the worker thread after the frame's batch runs.
    /// On a stopped coordinator this is a warning no-op.
    pub fn submit_frame(
        &self,
        stream_id: &str,
        rgb: Bytes,
        width: u32,
        height: u32,
        callback: BatchCallback,
    ) {
        if !self.running.load(Ordering::SeqCst) {
            warn!("Batch coordinator stopped, dropping frame from {}", stream_id);
            return;
        }

        let pending = PendingFrame {
            frame: BatchFrame {
                stream_id: stream_id.to_string(),
                rgb,
                width,
                height,
            },
            callback,
            submitted: Instant::now(),
        };

        if self.tx.try_send(pending).is_err() {
            warn!("Batch queue full, dropping frame from {}", stream_id);
        }
    }

    /// Stop the worker. Remaining queued frames are drained in batches of
    /// up to `batch_size` before the worker exits; this joins it.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        info!("Batch coordinator stopped");
    }
}

impl Drop for BatchCoordinator {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn worker_loop(
    rx: Receiver<PendingFrame>,
    runner: Arc<dyn BatchRunner>,
    running: Arc<AtomicBool>,
    batch_size: usize,
    batch_timeout: Duration,
    confidence_threshold: Arc<AtomicU32>,
) {
    let mut batch: Vec<PendingFrame> = Vec::with_capacity(batch_size);

    while running.load(Ordering::SeqCst) {
        // Wait for a head frame; poll so a stop is noticed promptly.
        let head = match rx.recv_timeout(IDLE_POLL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        batch.clear();
        let deadline = head.submitted + batch_timeout;
        batch.push(head);

        while batch.len() < batch_size && running.load(Ordering::SeqCst) {
            match rx.recv_deadline(deadline) {
                Ok(frame) => batch.push(frame),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        process_batch(&runner, &confidence_threshold, batch.drain(..).collect());
    }

    // Drain whatever is still queued, in batch-sized chunks.
    let mut remaining: Vec<PendingFrame> = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        remaining.push(frame);
        if remaining.len() >= batch_size {
            process_batch(&runner, &confidence_threshold, std::mem::take(&mut remaining));
        }
    }
    if !remaining.is_empty() {
        process_batch(&runner, &confidence_threshold, remaining);
    }

    debug!("Batch coordinator worker exited");
}

fn process_batch(
    runner: &Arc<dyn BatchRunner>,
    confidence_threshold: &AtomicU32,
    pending: Vec<PendingFrame>,
) {
    if pending.is_empty() {
        return;
    }

    let frames: Vec<BatchFrame> = pending.iter().map(|p| p.frame.clone()).collect();
    let threshold = f32::from_bits(confidence_threshold.load(Ordering::Relaxed));
    let mut results = runner.run_batch(&frames, threshold);

    // Callbacks fire in submission order; a stream missing from the result
    // gets an empty list.
    for p in pending {
        let detections = results.remove(&p.frame.stream_id).unwrap_or_default();
        (p.callback)(detections);
    }
}
