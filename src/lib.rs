pub mod accel;
pub mod config;
pub mod error;
pub mod events;
pub mod inference;
pub mod ingest;
pub mod labels;
pub mod manager;
pub mod processor;
pub mod publisher;
pub mod types;

pub use accel::{AcceleratorSession, Device};
pub use config::DaemonConfig;
pub use error::{
    DeviceError, EdgewatchError, EventError, IngestError, PolicyError, PublishError, Result,
};
pub use events::EventCompositor;
pub use inference::batch::BatchCoordinator;
pub use inference::InferenceEngine;
pub use manager::StreamManager;
pub use processor::StreamProcessor;
pub use publisher::Publisher;
pub use types::{
    BoundingBox, Detection, DetectionEvent, EventLevel, EventStatus, Keypoint, ModelTask,
    StreamInfo, StreamState, StreamStatus, StreamTuning,
};
