//! Channel-driven ingest source for tests and for exercising the daemon
//! without a camera.

use crate::error::IngestError;
use crate::ingest::{IngestConfig, IngestEvent, IngestFactory, IngestPipeline, RawFrame};
use crate::types::now_ms;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A gray test frame of the given size.
pub fn test_frame(width: u32, height: u32) -> RawFrame {
    RawFrame {
        data: Bytes::from(vec![128u8; (width * height * 3) as usize]),
        width,
        height,
        timestamp_ms: now_ms(),
    }
}

#[derive(Default)]
struct MockState {
    senders: Vec<(usize, mpsc::Sender<IngestEvent>)>,
    spawn_count: usize,
    fail_spawn: bool,
}

/// Ingest factory whose pipelines are driven by the test instead of a
/// network source. Each spawn registers a sender; the test pushes frames,
/// errors, or end-of-stream through [`MockIngestFactory::latest_sender`].
#[derive(Clone, Default)]
pub struct MockIngestFactory {
    state: Arc<Mutex<MockState>>,
}

impl MockIngestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent spawn fail, as an unreachable source would.
    pub fn set_fail_spawn(&self, fail: bool) {
        self.state.lock().unwrap().fail_spawn = fail;
    }

    /// How many pipelines were spawned, including failed attempts.
    pub fn spawn_count(&self) -> usize {
        self.state.lock().unwrap().spawn_count
    }

    /// The sender feeding the most recently spawned pipeline.
    pub fn latest_sender(&self) -> Option<mpsc::Sender<IngestEvent>> {
        self.state
            .lock()
            .unwrap()
            .senders
            .last()
            .map(|(_, tx)| tx.clone())
    }
}

impl IngestFactory for MockIngestFactory {
    fn spawn(
        &self,
        config: &IngestConfig,
        tx: mpsc::Sender<IngestEvent>,
    ) -> Result<Box<dyn IngestPipeline>, IngestError> {
        let mut state = self.state.lock().unwrap();
        state.spawn_count += 1;

        if state.fail_spawn {
            return Err(IngestError::Start {
                details: format!("mock refusing {}", config.rtsp_url),
            });
        }

        let id = state.spawn_count;
        state.senders.push((id, tx));
        Ok(Box::new(MockPipeline {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockPipeline {
    id: usize,
    state: Arc<Mutex<MockState>>,
}

impl IngestPipeline for MockPipeline {
    fn stop(&mut self) {
        // Dropping the registered sender closes the frame channel, which is
        // how a torn-down source looks to the consumer.
        self.state
            .lock()
            .unwrap()
            .senders
            .retain(|(id, _)| *id != self.id);
    }
}
