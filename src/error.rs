use thiserror::Error;

/// Main error type for the edgewatch daemon.
#[derive(Error, Debug)]
pub enum EdgewatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Accelerator error: {0}")]
    Device(#[from] DeviceError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Event settings error: {0}")]
    Event(#[from] EventError),

    #[error("Stream policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },

    #[error("Graceful shutdown requested")]
    Shutdown,
}

impl EdgewatchError {
    pub fn component(component: impl Into<String>, message: impl Into<String>) -> Self {
        EdgewatchError::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation can make sense.
    ///
    /// Transient failures (ingest drops, bus disconnects, device timeouts)
    /// are recoverable; policy and configuration failures are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EdgewatchError::Ingest(_) => true,
            EdgewatchError::Publish(_) => true,
            EdgewatchError::Device(e) => e.is_recoverable(),
            EdgewatchError::Config(_)
            | EdgewatchError::Io(_)
            | EdgewatchError::Serialization(_)
            | EdgewatchError::Event(_)
            | EdgewatchError::Policy(_)
            | EdgewatchError::Component { .. }
            | EdgewatchError::Shutdown => false,
        }
    }

    /// Component name for structured logging.
    pub fn component_name(&self) -> &str {
        match self {
            EdgewatchError::Config(_) => "config",
            EdgewatchError::Io(_) => "io",
            EdgewatchError::Serialization(_) => "config",
            EdgewatchError::Device(_) => "accelerator",
            EdgewatchError::Ingest(_) => "ingest",
            EdgewatchError::Publish(_) => "publisher",
            EdgewatchError::Event(_) => "events",
            EdgewatchError::Policy(_) => "manager",
            EdgewatchError::Component { component, .. } => component,
            EdgewatchError::Shutdown => "system",
        }
    }
}

/// Accelerator device and network errors.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("Accelerator device unavailable: {details}")]
    Unavailable { details: String },

    #[error("Failed to configure network from {path}: {details}")]
    Configure { path: String, details: String },

    #[error("Model file unreadable: {path}")]
    ModelUnreadable { path: String },

    #[error("Stream I/O failed on {stream}: {details}")]
    StreamIo { stream: String, details: String },

    #[error("Stream I/O timed out on {stream}")]
    Timeout { stream: String },

    #[error("Inference engine not ready")]
    NotReady,
}

impl DeviceError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DeviceError::StreamIo { .. } | DeviceError::Timeout { .. }
        )
    }
}

/// RTSP ingest errors; these drive the reconnect state machine rather than
/// surfacing to callers.
#[derive(Error, Debug, Clone)]
pub enum IngestError {
    #[error("Failed to start ingest pipeline: {details}")]
    Start { details: String },

    #[error("Ingest source error: {details}")]
    Source { details: String },

    #[error("Ingest reached end of stream")]
    EndOfStream,

    #[error("No frames for {seconds} seconds")]
    Inactive { seconds: u64 },
}

/// Message bus errors. Publishing on a disconnected bus is not an error;
/// these only cover connection attempts.
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    #[error("Failed to connect to {url}: {details}")]
    Connect { url: String, details: String },

    #[error("Publish failed: {details}")]
    Publish { details: String },
}

/// Event-settings decode errors.
#[derive(Error, Debug, Clone)]
pub enum EventError {
    #[error("Malformed event settings: {details}")]
    Parse { details: String },
}

/// Violations of manager policy. These never mutate state.
#[derive(Error, Debug, Clone)]
pub enum PolicyError {
    #[error("Stream {stream_id} already exists")]
    DuplicateStream { stream_id: String },

    #[error("Maximum number of streams ({max}) reached")]
    CapacityExceeded { max: usize },

    #[error("Stream {stream_id} not found")]
    UnknownStream { stream_id: String },

    #[error("Stream ID cannot be empty")]
    EmptyStreamId,

    #[error("RTSP URL cannot be empty")]
    EmptyRtspUrl,
}

/// Convenience type alias for Results.
pub type Result<T> = std::result::Result<T, EdgewatchError>;
