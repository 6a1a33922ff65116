//! Process-wide accelerator session: one virtual device shared by every
//! model, with engines cached per model file so all streams referencing the
//! same HEF share one configured network.

use crate::accel::device::Device;
use crate::error::DeviceError;
use crate::inference::batch::{BatchCoordinator, EngineBatchRunner};
use crate::inference::InferenceEngine;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

static GLOBAL: OnceLock<Arc<AcceleratorSession>> = OnceLock::new();

/// Owns the virtual device and the engine registry keyed by model path.
///
/// The registry is the single strong owner of engines; batch coordinators
/// hold only weak back-references. All mutation goes through the registry
/// mutex, while inference submissions run concurrently and are arbitrated
/// by the device's own scheduler.
pub struct AcceleratorSession {
    device: Arc<dyn Device>,
    engines: Mutex<HashMap<String, Arc<InferenceEngine>>>,
    coordinators: Mutex<HashMap<String, Arc<BatchCoordinator>>>,
}

impl AcceleratorSession {
    pub fn new(device: Arc<dyn Device>) -> Arc<Self> {
        Arc::new(Self {
            device,
            engines: Mutex::new(HashMap::new()),
            coordinators: Mutex::new(HashMap::new()),
        })
    }

    /// Install the process-wide session. The first call wins; later calls
    /// return the existing session and drop their device.
    pub fn init_global(device: Arc<dyn Device>) -> Arc<Self> {
        GLOBAL.get_or_init(|| Self::new(device)).clone()
    }

    /// The process-wide session, if one was installed.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    /// Get or create the engine for a model file. The same path always
    /// yields the same shared instance.
    pub fn acquire_engine(&self, hef_path: &str) -> Result<Arc<InferenceEngine>, DeviceError> {
        let mut engines = self.engines.lock().unwrap();

        if let Some(engine) = engines.get(hef_path) {
            debug!("Reusing inference engine for {}", hef_path);
            return Ok(Arc::clone(engine));
        }

        let engine = Arc::new(InferenceEngine::new(hef_path, self.device.as_ref())?);
        engines.insert(hef_path.to_string(), Arc::clone(&engine));
        info!(
            "Inference engine registered for {} ({} total)",
            hef_path,
            engines.len()
        );
        Ok(engine)
    }

    /// Drop the registry's ownership of a model's engine and stop its
    /// coordinator. Streams still holding the engine keep it alive until
    /// their references drop.
    pub fn release_engine(&self, hef_path: &str) {
        if let Some(coordinator) = self.coordinators.lock().unwrap().remove(hef_path) {
            coordinator.stop();
        }
        if self.engines.lock().unwrap().remove(hef_path).is_some() {
            info!("Inference engine released for {}", hef_path);
        }
    }

    /// Get or create the batch coordinator for a batching-capable model.
    /// Returns `None` when the engine is unknown or runs single-frame.
    pub fn batch_coordinator(
        &self,
        hef_path: &str,
        batch_timeout: Duration,
    ) -> Option<Arc<BatchCoordinator>> {
        let engine = self.engines.lock().unwrap().get(hef_path).cloned()?;
        if engine.batch_size() <= 1 {
            return None;
        }

        let mut coordinators = self.coordinators.lock().unwrap();
        if let Some(existing) = coordinators.get(hef_path) {
            return Some(Arc::clone(existing));
        }

        let runner = Arc::new(EngineBatchRunner::new(&engine));
        let coordinator = BatchCoordinator::new(runner, batch_timeout);
        coordinators.insert(hef_path.to_string(), Arc::clone(&coordinator));
        info!("Batch coordinator created for {}", hef_path);
        Some(coordinator)
    }

    pub fn engine_count(&self) -> usize {
        self.engines.lock().unwrap().len()
    }

    /// Tear the session down: stop coordinators and drop every cached
    /// engine. Called exactly once at process shutdown.
    pub fn shutdown(&self) {
        for (_, coordinator) in self.coordinators.lock().unwrap().drain() {
            coordinator.stop();
        }
        self.engines.lock().unwrap().clear();
        info!("Accelerator session shut down");
    }
}
