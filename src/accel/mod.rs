//! Accelerator access: the device trait seam, the process-wide session and
//! engine registry, and an in-memory mock device.

pub mod device;
pub mod mock;
pub mod session;

pub use device::{ConfiguredNetwork, Device, InputInfo, NmsShape, OutputInfo, VSTREAM_TIMEOUT};
pub use session::AcceleratorSession;
