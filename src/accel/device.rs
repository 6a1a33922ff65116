use crate::error::DeviceError;
use std::path::Path;
use std::time::Duration;

/// Per-stream I/O timeout applied by runtime realizations; heavy models can
/// hold a vstream for a long time before the first batch drains.
pub const VSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Shape and layout of a configured network's input vstream.
///
/// The input queue carries packed RGB8 (`width * height * 3` bytes per
/// frame). `declared_batch_size` is what the model file asks for; the
/// engine decides what it actually uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub frame_size: usize,
    pub declared_batch_size: usize,
}

/// On-chip NMS metadata attached to an output vstream, when the model's
/// compiled graph ends in an NMS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmsShape {
    pub number_of_classes: usize,
    pub max_bboxes_per_class: usize,
}

/// Shape of one output vstream. Output queues carry 32-bit floats;
/// `frame_len` is the element count of a single frame's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub name: String,
    pub frame_len: usize,
    pub nms: Option<NmsShape>,
}

/// One network configured onto the accelerator, exposing its typed input
/// and output queues.
///
/// A realization must honor [`VSTREAM_TIMEOUT`] on both directions and must
/// tolerate interleaved submissions from other networks on the same device;
/// the device's own scheduler arbitrates.
pub trait ConfiguredNetwork: Send + std::fmt::Debug {
    fn input(&self) -> &InputInfo;

    fn outputs(&self) -> &[OutputInfo];

    /// Queue one input frame. `frame` must be exactly `input().frame_size`
    /// bytes of packed RGB8.
    fn write_input(&mut self, frame: &[u8]) -> Result<(), DeviceError>;

    /// Read one frame of the given output into `buf`, which must hold
    /// exactly `outputs()[index].frame_len` floats. Every output must be
    /// read for every written frame; leaving one unread stalls the device.
    fn read_output(&mut self, index: usize, buf: &mut [f32]) -> Result<(), DeviceError>;
}

/// The process-wide virtual accelerator device.
///
/// `configure` loads a model file and returns its first network group,
/// ready for vstream I/O. Configuring the same file twice yields
/// independent queues onto the same compiled network.
pub trait Device: Send + Sync {
    fn configure(&self, hef_path: &Path) -> Result<Box<dyn ConfiguredNetwork>, DeviceError>;
}
