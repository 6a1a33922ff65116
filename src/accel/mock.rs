//! In-memory accelerator for tests and hardware-less runs.
//!
//! A [`MockDevice`] hands out [`MockNetwork`]s scripted per model path: the
//! responder closure decides what every output vstream returns for every
//! written frame, so decode paths can be exercised end to end without a
//! device.

use crate::accel::device::{ConfiguredNetwork, Device, InputInfo, NmsShape, OutputInfo};
use crate::error::DeviceError;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Produces one output frame: `(frame_index, input_frame, output_index) -> floats`.
pub type OutputResponder = Arc<dyn Fn(usize, &[u8], usize) -> Vec<f32> + Send + Sync>;

/// Blueprint for the network a [`MockDevice`] configures for one model path.
#[derive(Clone)]
pub struct MockNetworkSpec {
    pub input: InputInfo,
    pub outputs: Vec<OutputInfo>,
    pub responder: OutputResponder,
}

impl MockNetworkSpec {
    /// A single-output on-chip-NMS network with all-zero output slots.
    pub fn nms(width: u32, height: u32, num_classes: usize, max_bboxes: usize, params_per_slot: usize) -> Self {
        let frame_len = num_classes * max_bboxes * params_per_slot;
        Self {
            input: InputInfo {
                name: "input0".to_string(),
                width,
                height,
                frame_size: (width * height * 3) as usize,
                declared_batch_size: 1,
            },
            outputs: vec![OutputInfo {
                name: "output0".to_string(),
                frame_len,
                nms: Some(NmsShape {
                    number_of_classes: num_classes,
                    max_bboxes_per_class: max_bboxes,
                }),
            }],
            responder: Arc::new(move |_, _, _| vec![0.0; frame_len]),
        }
    }

    /// A 9-output raw multi-scale pose head (P3/P4/P5 at strides 8/16/32),
    /// names following the compiled graph's conv layer numbering.
    pub fn raw_pose(width: u32, height: u32, num_classes: usize, num_keypoints: usize) -> Self {
        let mut outputs = Vec::new();
        for (convs, stride) in [(["conv43", "conv44", "conv45"], 8u32),
                                 (["conv57", "conv58", "conv59"], 16),
                                 (["conv70", "conv71", "conv72"], 32)] {
            let gw = (width / stride) as usize;
            let gh = (height / stride) as usize;
            let cells = gw * gh;
            for (i, conv) in convs.iter().enumerate() {
                let channels = match i {
                    0 => 64,
                    1 => num_classes,
                    _ => num_keypoints * 3,
                };
                outputs.push(OutputInfo {
                    name: format!("model/{conv}"),
                    frame_len: cells * channels,
                    nms: None,
                });
            }
        }
        let lens: Vec<usize> = outputs.iter().map(|o| o.frame_len).collect();
        Self {
            input: InputInfo {
                name: "input0".to_string(),
                width,
                height,
                frame_size: (width * height * 3) as usize,
                declared_batch_size: 1,
            },
            outputs,
            responder: Arc::new(move |_, _, idx| vec![0.0; lens[idx]]),
        }
    }

    pub fn with_responder(mut self, responder: OutputResponder) -> Self {
        self.responder = responder;
        self
    }

    pub fn with_declared_batch(mut self, batch: usize) -> Self {
        self.input.declared_batch_size = batch;
        self
    }
}

/// Mock virtual device: a registry of scripted networks keyed by model path.
#[derive(Default)]
pub struct MockDevice {
    specs: Mutex<HashMap<String, MockNetworkSpec>>,
    configure_count: AtomicUsize,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the network served for `hef_path`.
    pub fn register(&self, hef_path: impl Into<String>, spec: MockNetworkSpec) {
        self.specs.lock().unwrap().insert(hef_path.into(), spec);
    }

    /// How many times `configure` was called, across all paths.
    pub fn configure_count(&self) -> usize {
        self.configure_count.load(Ordering::SeqCst)
    }
}

impl Device for MockDevice {
    fn configure(&self, hef_path: &Path) -> Result<Box<dyn ConfiguredNetwork>, DeviceError> {
        self.configure_count.fetch_add(1, Ordering::SeqCst);
        let key = hef_path.to_string_lossy().to_string();
        let spec = self
            .specs
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(DeviceError::ModelUnreadable { path: key })?;
        Ok(Box::new(MockNetwork::new(spec)))
    }
}

/// Scripted network honoring vstream queue semantics: every written frame
/// must have every output read before the next frame's outputs appear.
pub struct MockNetwork {
    spec: MockNetworkSpec,
    written: VecDeque<(usize, Vec<u8>)>,
    reads_done: Vec<bool>,
    frames_written: usize,
}

impl std::fmt::Debug for MockNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNetwork")
            .field("reads_done", &self.reads_done)
            .field("frames_written", &self.frames_written)
            .finish()
    }
}

impl MockNetwork {
    fn new(spec: MockNetworkSpec) -> Self {
        let n_outputs = spec.outputs.len();
        Self {
            spec,
            written: VecDeque::new(),
            reads_done: vec![false; n_outputs],
            frames_written: 0,
        }
    }
}

impl ConfiguredNetwork for MockNetwork {
    fn input(&self) -> &InputInfo {
        &self.spec.input
    }

    fn outputs(&self) -> &[OutputInfo] {
        &self.spec.outputs
    }

    fn write_input(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        if frame.len() != self.spec.input.frame_size {
            return Err(DeviceError::StreamIo {
                stream: self.spec.input.name.clone(),
                details: format!(
                    "frame size {} does not match input size {}",
                    frame.len(),
                    self.spec.input.frame_size
                ),
            });
        }
        self.written.push_back((self.frames_written, frame.to_vec()));
        self.frames_written += 1;
        Ok(())
    }

    fn read_output(&mut self, index: usize, buf: &mut [f32]) -> Result<(), DeviceError> {
        let info = self
            .spec
            .outputs
            .get(index)
            .ok_or(DeviceError::StreamIo {
                stream: format!("output{index}"),
                details: "no such output".to_string(),
            })?
            .clone();

        let (frame_idx, frame) = self.written.front().ok_or(DeviceError::Timeout {
            stream: info.name.clone(),
        })?;

        let data = (self.spec.responder)(*frame_idx, frame, index);
        if data.len() != info.frame_len || buf.len() != info.frame_len {
            return Err(DeviceError::StreamIo {
                stream: info.name,
                details: format!(
                    "output length mismatch: responder {}, buffer {}, expected {}",
                    data.len(),
                    buf.len(),
                    info.frame_len
                ),
            });
        }
        buf.copy_from_slice(&data);

        self.reads_done[index] = true;
        if self.reads_done.iter().all(|done| *done) {
            self.written.pop_front();
            self.reads_done.fill(false);
        }
        Ok(())
    }
}
