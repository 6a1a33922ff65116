//! GStreamer realization of the ingest contract: an `rtspsrc` pipeline
//! decoding H.264 to packed RGB frames delivered through an appsink.

use crate::error::IngestError;
use crate::ingest::{IngestConfig, IngestEvent, IngestFactory, IngestPipeline, RawFrame};
use crate::types::now_ms;
use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer::Pipeline;
use gstreamer_app::AppSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Spawns RTSP pipelines decoding to RGB appsink frames.
pub struct GstIngestFactory;

impl GstIngestFactory {
    pub fn new() -> Result<Self, IngestError> {
        gstreamer::init().map_err(|e| IngestError::Start {
            details: format!("GStreamer init failed: {e}"),
        })?;
        Ok(Self)
    }

    fn pipeline_string(config: &IngestConfig) -> String {
        format!(
            "rtspsrc location=\"{}\" latency={} timeout={} retry={} protocols=tcp name=src \
             ! rtph264depay ! h264parse ! avdec_h264 \
             ! videoconvert ! video/x-raw,format=RGB \
             ! appsink name=sink sync=false max-buffers=1 drop=true",
            config.rtsp_url, config.latency_ms, config.timeout_us, config.retry
        )
    }
}

impl IngestFactory for GstIngestFactory {
    fn spawn(
        &self,
        config: &IngestConfig,
        tx: mpsc::Sender<IngestEvent>,
    ) -> Result<Box<dyn IngestPipeline>, IngestError> {
        let description = Self::pipeline_string(config);
        info!("Creating ingest pipeline: {}", description);

        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|e| IngestError::Start {
                details: format!("pipeline parse failed: {e}"),
            })?
            .downcast::<Pipeline>()
            .map_err(|_| IngestError::Start {
                details: "parsed element is not a pipeline".to_string(),
            })?;

        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<AppSink>().ok())
            .ok_or_else(|| IngestError::Start {
                details: "appsink element missing".to_string(),
            })?;

        let frame_tx = tx.clone();
        appsink.set_callbacks(
            gstreamer_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;

                    let (width, height) = sample
                        .caps()
                        .and_then(|caps| caps.structure(0))
                        .map(|s| {
                            (
                                s.get::<i32>("width").unwrap_or(0),
                                s.get::<i32>("height").unwrap_or(0),
                            )
                        })
                        .unwrap_or((0, 0));

                    if width <= 0 || height <= 0 {
                        return Ok(gstreamer::FlowSuccess::Ok);
                    }

                    if let Some(buffer) = sample.buffer() {
                        if let Ok(map) = buffer.map_readable() {
                            let frame = RawFrame {
                                data: Bytes::copy_from_slice(map.as_slice()),
                                width: width as u32,
                                height: height as u32,
                                timestamp_ms: now_ms(),
                            };
                            // Lagging consumers drop frames here, mirroring
                            // the appsink's own drop policy.
                            if frame_tx.try_send(IngestEvent::Frame(frame)).is_err() {
                                debug!("Frame channel full, dropping ingest frame");
                            }
                        }
                    }

                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| IngestError::Start {
                details: format!("failed to start pipeline: {e}"),
            })?;

        // Bus watcher: surfaces errors and end-of-stream to the consumer.
        let bus = pipeline.bus().ok_or_else(|| IngestError::Start {
            details: "pipeline has no bus".to_string(),
        })?;
        let running = Arc::new(AtomicBool::new(true));
        let watcher_running = Arc::clone(&running);
        let bus_thread = std::thread::Builder::new()
            .name("gst-ingest-bus".to_string())
            .spawn(move || {
                use gstreamer::MessageView;

                while watcher_running.load(Ordering::SeqCst) {
                    let Some(msg) = bus.timed_pop(gstreamer::ClockTime::from_mseconds(250)) else {
                        continue;
                    };

                    match msg.view() {
                        MessageView::Error(err) => {
                            let details = err.error().to_string();
                            warn!("Ingest pipeline error: {}", details);
                            let _ = tx.try_send(IngestEvent::Error(details));
                            break;
                        }
                        MessageView::Eos(_) => {
                            warn!("Ingest pipeline reached end of stream");
                            let _ = tx.try_send(IngestEvent::EndOfStream);
                            break;
                        }
                        _ => {}
                    }
                }
            })
            .map_err(|e| IngestError::Start {
                details: format!("failed to spawn bus watcher: {e}"),
            })?;

        Ok(Box::new(GstIngest {
            pipeline,
            running,
            bus_thread: Some(bus_thread),
        }))
    }
}

struct GstIngest {
    pipeline: Pipeline,
    running: Arc<AtomicBool>,
    bus_thread: Option<std::thread::JoinHandle<()>>,
}

impl IngestPipeline for GstIngest {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.pipeline.set_state(gstreamer::State::Null);
        if let Some(thread) = self.bus_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for GstIngest {
    fn drop(&mut self) {
        self.stop();
    }
}
