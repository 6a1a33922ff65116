//! Shared-accelerator inference: per-model engines over the device seam,
//! letterbox preprocessing, and output decoding.

pub mod batch;
pub mod decode;
pub mod letterbox;

use crate::accel::device::Device;
use crate::accel::ConfiguredNetwork;
use crate::error::DeviceError;
use crate::types::{Detection, ModelTask};
use bytes::Bytes;
use decode::DecodeContext;
use letterbox::{letterbox_resize, Letterbox, PAD_VALUE};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One frame handed to batch inference, tagged with the stream it belongs to
/// so results can be fanned back out.
#[derive(Debug, Clone)]
pub struct BatchFrame {
    pub stream_id: String,
    pub rgb: Bytes,
    pub width: u32,
    pub height: u32,
}

/// How this model's outputs are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    /// Single output carrying on-chip NMS rows per class.
    Nms {
        num_classes: usize,
        max_bboxes_per_class: usize,
    },
    /// Raw multi-scale YOLO head, one DFL/class/keypoint triple per scale.
    RawYolo,
    /// No supported decode path; inference returns empty.
    Unsupported,
}

#[derive(Debug, Clone, Default)]
struct ModelConfig {
    task: ModelTask,
    num_keypoints: usize,
    labels: Vec<String>,
}

/// Network handle plus the I/O buffers it exclusively owns. Held under the
/// inference mutex so calls are serialized per engine; the device scheduler
/// interleaves different engines on the shared session.
#[derive(Debug)]
struct EngineState {
    network: Box<dyn ConfiguredNetwork>,
    input_buffer: Vec<u8>,
    output_buffers: Vec<Vec<f32>>,
    output_names: Vec<String>,
}

/// Inference wrapper for one model file on the shared accelerator session.
///
/// Input I/O is 8-bit RGB, outputs are 32-bit floats. Construction
/// enumerates the vstreams and classifies the output head; a per-engine
/// mutex serializes inference while different engines run concurrently.
#[derive(Debug)]
pub struct InferenceEngine {
    hef_path: String,
    input_width: u32,
    input_height: u32,
    batch_size: usize,
    mode: OutputMode,
    state: Mutex<EngineState>,
    model: Mutex<ModelConfig>,
    inference_count: AtomicU64,
}

impl InferenceEngine {
    /// Load and configure `hef_path` on the shared device.
    pub fn new(hef_path: &str, device: &dyn Device) -> Result<Self, DeviceError> {
        info!("Initializing inference engine for {}", hef_path);

        let network = device.configure(Path::new(hef_path))?;

        let input = network.input().clone();
        let outputs: Vec<_> = network.outputs().to_vec();
        if outputs.is_empty() {
            return Err(DeviceError::Configure {
                path: hef_path.to_string(),
                details: "network has no output vstreams".to_string(),
            });
        }

        let mode = if let Some(nms) = outputs[0].nms.filter(|n| n.number_of_classes > 0) {
            info!(
                "NMS output: {} classes, {} max bboxes/class",
                nms.number_of_classes, nms.max_bboxes_per_class
            );
            OutputMode::Nms {
                num_classes: nms.number_of_classes,
                max_bboxes_per_class: nms.max_bboxes_per_class,
            }
        } else if outputs.len() > 1 {
            info!(
                "Multi-output model: {} output vstreams, raw multi-scale decoding",
                outputs.len()
            );
            OutputMode::RawYolo
        } else {
            warn!("Model {} has no supported decode path", hef_path);
            OutputMode::Unsupported
        };

        // Declared batches above one stall the device scheduler under
        // concurrent network groups; pin to single-frame submission.
        let batch_size = 1;
        if input.declared_batch_size > batch_size {
            debug!(
                "Model declares batch {}, pinned to {}",
                input.declared_batch_size, batch_size
            );
        }

        info!(
            "Model input: {}x{}, batch={}, {} output(s)",
            input.width,
            input.height,
            batch_size,
            outputs.len()
        );

        let input_buffer = vec![0u8; input.frame_size];
        let output_buffers: Vec<Vec<f32>> =
            outputs.iter().map(|o| vec![0.0; o.frame_len]).collect();
        let output_names: Vec<String> = outputs.iter().map(|o| o.name.clone()).collect();

        Ok(Self {
            hef_path: hef_path.to_string(),
            input_width: input.width,
            input_height: input.height,
            batch_size,
            mode,
            state: Mutex::new(EngineState {
                network,
                input_buffer,
                output_buffers,
                output_names,
            }),
            model: Mutex::new(ModelConfig::default()),
            inference_count: AtomicU64::new(0),
        })
    }

    pub fn hef_path(&self) -> &str {
        &self.hef_path
    }

    pub fn input_width(&self) -> u32 {
        self.input_width
    }

    pub fn input_height(&self) -> u32 {
        self.input_height
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Update the per-output semantics. Buffer layout is untouched; this
    /// only affects decoding and class naming.
    pub fn set_model_config(&self, task: ModelTask, num_keypoints: usize, labels: Vec<String>) {
        let mut model = self.model.lock().unwrap();
        info!(
            "Model config for {}: task={}, keypoints={}, labels={}",
            self.hef_path,
            task.as_str(),
            num_keypoints,
            labels.len()
        );
        model.task = task;
        model.num_keypoints = num_keypoints;
        model.labels = labels;
    }

    /// Run one frame of inference and return detections mapped back to the
    /// original frame. Device failures are logged and yield an empty list.
    pub fn run_inference(
        &self,
        rgb: &[u8],
        width: u32,
        height: u32,
        confidence_threshold: f32,
    ) -> Vec<Detection> {
        if self.mode == OutputMode::Unsupported {
            return Vec::new();
        }

        if rgb.len() < (width * height * 3) as usize {
            warn!(
                "Frame buffer too small: {} bytes for {}x{}",
                rgb.len(),
                width,
                height
            );
            return Vec::new();
        }

        let model = self.model.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();

        let count = self.inference_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 {
            info!(
                "First inference on {}: frame {}x{} -> input {}x{}",
                self.hef_path, width, height, self.input_width, self.input_height
            );
        }

        let letterbox = self.fill_input(&mut state.input_buffer, rgb, width, height);

        if let Err(e) = Self::submit_and_read(&mut state) {
            warn!("Inference I/O failed on {}: {}", self.hef_path, e);
            // Give the device queue a moment before the next frame hits it.
            std::thread::sleep(Duration::from_millis(100));
            return Vec::new();
        }

        self.decode(&state, &model, letterbox, width, height, confidence_threshold)
    }

    /// Run up to `batch_size` frames as one submission. The batch is padded
    /// to the declared size with gray fill; padding slots are discarded.
    pub fn run_batch_inference(
        &self,
        frames: &[BatchFrame],
        confidence_threshold: f32,
    ) -> HashMap<String, Vec<Detection>> {
        let mut results = HashMap::new();

        if self.mode == OutputMode::Unsupported || frames.is_empty() {
            return results;
        }

        let model = self.model.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();

        let actual_batch = frames.len().min(self.batch_size);
        let frame_size = (self.input_width * self.input_height * 3) as usize;

        let mut letterboxes = Vec::with_capacity(actual_batch);
        let mut batch_buffers = vec![vec![PAD_VALUE; frame_size]; self.batch_size];

        for (slot, buffer) in batch_buffers.iter_mut().enumerate() {
            if let Some(frame) = frames.get(slot).filter(|_| slot < actual_batch) {
                if frame.rgb.len() < (frame.width * frame.height * 3) as usize {
                    warn!("Batch frame from {} is undersized, padding slot", frame.stream_id);
                    letterboxes.push(Letterbox::identity(frame.width, frame.height));
                    continue;
                }
                let lb = self.fill_input(buffer, &frame.rgb, frame.width, frame.height);
                letterboxes.push(lb);
            }
            // Remaining slots stay gray-filled.
        }

        // The device treats a batch as N sequential writes followed by N
        // reads of every output.
        for buffer in &batch_buffers {
            if let Err(e) = state.network.write_input(buffer) {
                warn!("Batch write failed on {}: {}", self.hef_path, e);
                return results;
            }
        }

        for (frame_idx, frame) in frames.iter().take(actual_batch).enumerate() {
            if let Err(e) = Self::read_outputs(&mut state) {
                warn!(
                    "Batch read failed on {} at frame {}: {}",
                    self.hef_path, frame_idx, e
                );
                return results;
            }

            let detections = self.decode(
                &state,
                &model,
                letterboxes[frame_idx],
                frame.width,
                frame.height,
                confidence_threshold,
            );
            results.insert(frame.stream_id.clone(), detections);
        }

        // Padding slots still hold queued outputs; leaving them unread
        // would stall the next submission.
        for _ in actual_batch..self.batch_size {
            if Self::read_outputs(&mut state).is_err() {
                break;
            }
        }

        results
    }

    fn fill_input(&self, input_buffer: &mut [u8], rgb: &[u8], width: u32, height: u32) -> Letterbox {
        if width == self.input_width && height == self.input_height {
            input_buffer.copy_from_slice(&rgb[..input_buffer.len()]);
            Letterbox::identity(width, height)
        } else {
            letterbox_resize(
                rgb,
                width,
                height,
                input_buffer,
                self.input_width,
                self.input_height,
            )
        }
    }

    fn submit_and_read(state: &mut EngineState) -> Result<(), DeviceError> {
        let input = std::mem::take(&mut state.input_buffer);
        let result = state.network.write_input(&input);
        state.input_buffer = input;
        result?;
        Self::read_outputs(state)
    }

    /// Read every output vstream in order; leaving any unread overflows the
    /// device-side queue on the next frame.
    fn read_outputs(state: &mut EngineState) -> Result<(), DeviceError> {
        let mut buffers = std::mem::take(&mut state.output_buffers);
        let mut result = Ok(());
        for (idx, buffer) in buffers.iter_mut().enumerate() {
            if let Err(e) = state.network.read_output(idx, buffer) {
                result = Err(e);
                break;
            }
        }
        state.output_buffers = buffers;
        result
    }

    fn decode(
        &self,
        state: &EngineState,
        model: &ModelConfig,
        letterbox: Letterbox,
        frame_width: u32,
        frame_height: u32,
        confidence_threshold: f32,
    ) -> Vec<Detection> {
        let ctx = DecodeContext {
            input_width: self.input_width,
            input_height: self.input_height,
            frame_width,
            frame_height,
            letterbox,
            confidence_threshold,
            task: model.task,
            num_keypoints: model.num_keypoints,
            labels: &model.labels,
        };

        match self.mode {
            OutputMode::Nms {
                num_classes,
                max_bboxes_per_class,
            } => decode::decode_nms_output(
                &state.output_buffers[0],
                num_classes,
                max_bboxes_per_class,
                &ctx,
            ),
            OutputMode::RawYolo => {
                decode::decode_raw_yolo(&state.output_buffers, &state.output_names, &ctx)
            }
            OutputMode::Unsupported => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::mock::{MockDevice, MockNetworkSpec};
    use std::sync::Arc;

    fn nms_device(path: &str, input: u32) -> MockDevice {
        let device = MockDevice::new();
        // One class, one slot: a centered half-frame box with score 0.9.
        device.register(
            path,
            MockNetworkSpec::nms(input, input, 1, 1, 5).with_responder(Arc::new(|_, _, _| {
                vec![0.25, 0.25, 0.75, 0.75, 0.9]
            })),
        );
        device
    }

    #[test]
    fn test_engine_nms_inference_maps_to_frame() {
        let device = nms_device("/models/det.hef", 64);
        let engine = InferenceEngine::new("/models/det.hef", &device).unwrap();
        engine.set_model_config(ModelTask::Det, 0, vec!["person".to_string()]);

        // Square frame, same aspect: identity-free mapping through scale.
        let frame = vec![0u8; 128 * 128 * 3];
        let dets = engine.run_inference(&frame, 128, 128, 0.5);

        assert_eq!(dets.len(), 1);
        let det = &dets[0];
        assert_eq!(det.class_name, "person");
        assert_eq!(det.bbox.x, 32);
        assert_eq!(det.bbox.y, 32);
        assert_eq!(det.bbox.width, 64);
        assert_eq!(det.bbox.height, 64);
        assert!(det.confidence >= 0.5);
    }

    #[test]
    fn test_engine_threshold_filters() {
        let device = nms_device("/models/det.hef", 64);
        let engine = InferenceEngine::new("/models/det.hef", &device).unwrap();
        let frame = vec![0u8; 64 * 64 * 3];
        assert!(engine.run_inference(&frame, 64, 64, 0.95).is_empty());
    }

    #[test]
    fn test_engine_batch_pinned_to_one() {
        let device = nms_device("/models/det.hef", 64);
        device.register(
            "/models/batched.hef",
            MockNetworkSpec::nms(64, 64, 1, 1, 5).with_declared_batch(4),
        );
        let engine = InferenceEngine::new("/models/batched.hef", &device).unwrap();
        assert_eq!(engine.batch_size(), 1);
    }

    #[test]
    fn test_engine_batch_inference_fans_out_by_stream() {
        let device = nms_device("/models/det.hef", 64);
        let engine = InferenceEngine::new("/models/det.hef", &device).unwrap();

        let frames = vec![
            BatchFrame {
                stream_id: "s1".to_string(),
                rgb: Bytes::from(vec![0u8; 64 * 64 * 3]),
                width: 64,
                height: 64,
            },
            BatchFrame {
                stream_id: "s2".to_string(),
                rgb: Bytes::from(vec![0u8; 64 * 64 * 3]),
                width: 64,
                height: 64,
            },
        ];

        // Batch is pinned to one: only the first frame is processed.
        let results = engine.run_batch_inference(&frames, 0.5);
        assert_eq!(results.len(), 1);
        assert!(results.contains_key("s1"));
        assert_eq!(results["s1"].len(), 1);
    }

    #[test]
    fn test_engine_unsupported_mode_returns_empty() {
        let device = MockDevice::new();
        // Single output without NMS metadata: no decode path.
        let mut spec = MockNetworkSpec::nms(32, 32, 1, 1, 5);
        spec.outputs[0].nms = None;
        device.register("/models/odd.hef", spec);

        let engine = InferenceEngine::new("/models/odd.hef", &device).unwrap();
        let frame = vec![0u8; 32 * 32 * 3];
        assert!(engine.run_inference(&frame, 32, 32, 0.1).is_empty());
    }

    #[test]
    fn test_engine_configure_error_propagates() {
        let device = MockDevice::new();
        let err = InferenceEngine::new("/models/missing.hef", &device).unwrap_err();
        assert!(matches!(err, DeviceError::ModelUnreadable { .. }));
    }

    #[test]
    fn test_engine_raw_mode_classification() {
        let device = MockDevice::new();
        device.register("/models/pose.hef", MockNetworkSpec::raw_pose(96, 96, 2, 4));
        let engine = InferenceEngine::new("/models/pose.hef", &device).unwrap();
        assert_eq!(engine.mode, OutputMode::RawYolo);

        // All-zero outputs decode to nothing above threshold.
        engine.set_model_config(ModelTask::Pose, 4, vec![]);
        let frame = vec![0u8; 96 * 96 * 3];
        assert!(engine.run_inference(&frame, 96, 96, 0.9).is_empty());
    }
}
