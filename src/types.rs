use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Axis-aligned pixel rectangle in original-frame coordinates.
///
/// Always clamped to the frame by the producer, so `x + width <= frame_width`
/// and `y + height <= frame_height` hold for every emitted box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0) as i64 * (y2 - y1).max(0) as i64;
        let union = self.area() + other.area() - inter;

        if union > 0 {
            inter as f32 / union as f32
        } else {
            0.0
        }
    }
}

/// Pose keypoint normalized to the original frame.
///
/// `x` and `y` are in `[0, 1]`; `visible` is a visibility/confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub visible: f32,
}

/// A single detected object for one frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub class_id: i32,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Ordered keypoints; length is fixed per model (empty for pure detection).
    #[serde(default)]
    pub keypoints: Vec<Keypoint>,
    /// Event settings this object triggered. Multiple regions may match;
    /// the compositor appends without duplicates.
    #[serde(default)]
    pub event_setting_ids: Vec<String>,
}

/// Severity of an evaluated event for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum EventLevel {
    #[default]
    Safe,
    Warning,
    Danger,
}

impl EventLevel {
    pub fn as_i32(self) -> i32 {
        match self {
            EventLevel::Safe => 0,
            EventLevel::Warning => 1,
            EventLevel::Danger => 2,
        }
    }
}

impl Serialize for EventLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for EventLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match i32::deserialize(deserializer)? {
            0 => Ok(EventLevel::Safe),
            1 => Ok(EventLevel::Warning),
            2 => Ok(EventLevel::Danger),
            other => Err(serde::de::Error::custom(format!(
                "invalid event level: {other}"
            ))),
        }
    }
}

/// Per-event evaluation result for one frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventStatus {
    pub status: EventLevel,
    /// Class names that produced a non-safe contribution, in first-seen order.
    pub labels: Vec<String>,
}

impl EventStatus {
    /// Fold in one detection's contribution, keeping the maximum severity.
    pub fn raise(&mut self, level: EventLevel, label: &str) {
        if level > self.status {
            self.status = level;
        }
        if level > EventLevel::Safe && !self.labels.iter().any(|l| l == label) {
            self.labels.push(label.to_string());
        }
    }
}

/// Per-frame envelope carrying detections and evaluated event statuses.
#[derive(Debug, Clone, Default)]
pub struct DetectionEvent {
    pub stream_id: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub frame_number: u64,
    pub fps: f64,
    pub width: i32,
    pub height: i32,
    pub detections: Vec<Detection>,
    pub events: HashMap<String, EventStatus>,
    /// Encoded snapshot of the frame, present when image publishing is on.
    pub image_data: Option<Bytes>,
}

/// Inference task kind declared per model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTask {
    #[default]
    Det,
    Pose,
}

impl ModelTask {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelTask::Det => "det",
            ModelTask::Pose => "pose",
        }
    }

    pub fn parse(s: &str) -> ModelTask {
        if s.eq_ignore_ascii_case("pose") {
            ModelTask::Pose
        } else {
            ModelTask::Det
        }
    }
}

/// Per-stream tunables, defaulting to the daemon's configured stream section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamTuning {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub confidence_threshold: f32,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            confidence_threshold: 0.5,
        }
    }
}

/// Everything needed to bring one stream up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub rtsp_url: String,
    /// Model file path; empty means video-only (no inference).
    #[serde(default)]
    pub hef_path: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub task: ModelTask,
    #[serde(default)]
    pub num_keypoints: usize,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub config: StreamTuning,
}

/// Lifecycle state of a stream processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    Starting,
    Running,
    #[default]
    Stopped,
    Error,
    Reconnecting,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Starting => "STARTING",
            StreamState::Running => "RUNNING",
            StreamState::Stopped => "STOPPED",
            StreamState::Error => "ERROR",
            StreamState::Reconnecting => "RECONNECTING",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one stream's runtime state, for status queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStatus {
    pub stream_id: String,
    pub rtsp_url: String,
    pub model_id: String,
    pub state: StreamState,
    pub frame_count: u64,
    pub current_fps: f64,
    pub uptime_seconds: u64,
    pub last_error: String,
    /// Unix ms of the last frame that carried at least one detection.
    pub last_detection_time: i64,
}

/// Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Callback invoked with every assembled per-frame envelope.
pub type DetectionCallback = std::sync::Arc<dyn Fn(&DetectionEvent) + Send + Sync>;
/// Callback invoked on every stream state transition.
pub type StateChangeCallback = std::sync::Arc<dyn Fn(&str, StreamState) + Send + Sync>;
/// Callback invoked when a stream records an error.
pub type ErrorCallback = std::sync::Arc<dyn Fn(&str, &str) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_iou() {
        let a = BoundingBox {
            x: 0,
            y: 0,
            width: 10,
            height: 10,
        };
        let b = BoundingBox {
            x: 5,
            y: 5,
            width: 10,
            height: 10,
        };
        // 25 overlap, 175 union
        let iou = a.iou(&b);
        assert!((iou - 25.0 / 175.0).abs() < 1e-6);

        let disjoint = BoundingBox {
            x: 100,
            y: 100,
            width: 5,
            height: 5,
        };
        assert_eq!(a.iou(&disjoint), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_event_level_ordering() {
        assert!(EventLevel::Danger > EventLevel::Warning);
        assert!(EventLevel::Warning > EventLevel::Safe);
    }

    #[test]
    fn test_event_status_raise() {
        let mut status = EventStatus::default();
        status.raise(EventLevel::Safe, "person");
        assert_eq!(status.status, EventLevel::Safe);
        assert!(status.labels.is_empty());

        status.raise(EventLevel::Warning, "person");
        assert_eq!(status.status, EventLevel::Warning);
        assert_eq!(status.labels, vec!["person".to_string()]);

        // Lower severity never downgrades, duplicate labels collapse.
        status.raise(EventLevel::Danger, "person");
        status.raise(EventLevel::Warning, "car");
        assert_eq!(status.status, EventLevel::Danger);
        assert_eq!(status.labels, vec!["person".to_string(), "car".to_string()]);
    }

    #[test]
    fn test_detection_json_round_trip() {
        let det = Detection {
            class_name: "person".to_string(),
            class_id: 0,
            confidence: 0.87,
            bbox: BoundingBox {
                x: 10,
                y: 20,
                width: 30,
                height: 40,
            },
            keypoints: vec![Keypoint {
                x: 0.5,
                y: 0.25,
                visible: 0.9,
            }],
            event_setting_ids: vec!["roi-1".to_string()],
        };

        let json = serde_json::to_string(&det).unwrap();
        let back: Detection = serde_json::from_str(&json).unwrap();
        assert_eq!(det, back);
    }

    #[test]
    fn test_stream_state_strings() {
        assert_eq!(StreamState::Starting.as_str(), "STARTING");
        assert_eq!(StreamState::Reconnecting.as_str(), "RECONNECTING");
        assert_eq!(StreamState::default(), StreamState::Stopped);
    }

    #[test]
    fn test_model_task_parse() {
        assert_eq!(ModelTask::parse("pose"), ModelTask::Pose);
        assert_eq!(ModelTask::parse("POSE"), ModelTask::Pose);
        assert_eq!(ModelTask::parse("det"), ModelTask::Det);
        assert_eq!(ModelTask::parse("anything"), ModelTask::Det);
    }
}
