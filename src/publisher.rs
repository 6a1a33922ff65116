//! Message-bus publisher: serializes per-frame envelopes to JSON and
//! publishes them under `stream.<stream_id>`.
//!
//! The connection is lazy. A failed connect starts a background task that
//! retries on an interval; publishing while disconnected is a silent no-op
//! so frames are never buffered unboundedly.

use crate::config::NatsConfig;
use crate::error::PublishError;
use crate::types::{now_ms, DetectionEvent};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection state of the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl BusState {
    fn from_u8(v: u8) -> BusState {
        match v {
            1 => BusState::Connecting,
            2 => BusState::Connected,
            3 => BusState::Reconnecting,
            _ => BusState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BusState::Disconnected => 0,
            BusState::Connecting => 1,
            BusState::Connected => 2,
            BusState::Reconnecting => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BusState::Disconnected => "DISCONNECTED",
            BusState::Connecting => "CONNECTING",
            BusState::Connected => "CONNECTED",
            BusState::Reconnecting => "RECONNECTING",
        }
    }
}

/// Publisher counters for status queries.
#[derive(Debug, Clone, Default)]
pub struct PublisherStats {
    pub messages_published: u64,
    pub last_publish_time: i64,
    pub reconnect_attempts: u32,
    pub last_error: String,
}

struct PublisherInner {
    url: Mutex<String>,
    client: tokio::sync::Mutex<Option<async_nats::Client>>,
    state: AtomicU8,
    auto_reconnect: AtomicBool,
    reconnect_interval: Duration,
    connection_timeout: Duration,
    reconnect_running: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    messages_published: AtomicU64,
    last_publish_time: AtomicI64,
    reconnect_attempts: AtomicU32,
    last_error: Mutex<String>,
}

/// Bus client with lazy connect and background reconnect.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    pub fn new(config: &NatsConfig) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url: Mutex::new(config.url.clone()),
                client: tokio::sync::Mutex::new(None),
                state: AtomicU8::new(BusState::Disconnected.as_u8()),
                auto_reconnect: AtomicBool::new(config.auto_reconnect),
                reconnect_interval: Duration::from_secs(config.reconnect_interval_seconds.max(1)),
                connection_timeout: Duration::from_millis(config.connection_timeout_ms.max(100)),
                reconnect_running: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
                messages_published: AtomicU64::new(0),
                last_publish_time: AtomicI64::new(0),
                reconnect_attempts: AtomicU32::new(0),
                last_error: Mutex::new(String::new()),
            }),
        }
    }

    /// Attempt to connect. Idempotent; on failure the background reconnect
    /// task is started (when enabled) and the error is returned.
    pub async fn connect(&self) -> Result<(), PublishError> {
        match Self::try_connect(&self.inner).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.inner.auto_reconnect.load(Ordering::SeqCst) {
                    Self::spawn_reconnect(&self.inner);
                }
                Err(e)
            }
        }
    }

    async fn try_connect(inner: &Arc<PublisherInner>) -> Result<(), PublishError> {
        let mut client_guard = inner.client.lock().await;

        if let Some(client) = client_guard.as_ref() {
            if client.connection_state() == async_nats::connection::State::Connected {
                set_state(inner, BusState::Connected);
                return Ok(());
            }
        }

        set_state(inner, BusState::Connecting);
        let url = inner.url.lock().unwrap().clone();
        info!("Connecting to message bus at {}", url);

        let connect = tokio::time::timeout(inner.connection_timeout, async_nats::connect(url.as_str()));
        match connect.await {
            Ok(Ok(client)) => {
                *client_guard = Some(client);
                set_state(inner, BusState::Connected);
                inner.reconnect_attempts.store(0, Ordering::SeqCst);
                info!("Connected to message bus at {}", url);
                Ok(())
            }
            Ok(Err(e)) => {
                set_state(inner, BusState::Disconnected);
                let err = PublishError::Connect {
                    url,
                    details: e.to_string(),
                };
                record_error(inner, &err);
                Err(err)
            }
            Err(_) => {
                set_state(inner, BusState::Disconnected);
                let err = PublishError::Connect {
                    url,
                    details: format!("timed out after {:?}", inner.connection_timeout),
                };
                record_error(inner, &err);
                Err(err)
            }
        }
    }

    fn spawn_reconnect(inner: &Arc<PublisherInner>) {
        if inner.reconnect_running.swap(true, Ordering::SeqCst) {
            return;
        }

        set_state(inner, BusState::Reconnecting);
        let task_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            info!("Bus reconnect task started");
            loop {
                tokio::time::sleep(task_inner.reconnect_interval).await;

                if !task_inner.reconnect_running.load(Ordering::SeqCst)
                    || !task_inner.auto_reconnect.load(Ordering::SeqCst)
                {
                    break;
                }

                let attempt = task_inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("Bus reconnect attempt {}", attempt);

                if Self::try_connect(&task_inner).await.is_ok() {
                    info!("Bus reconnected after {} attempt(s)", attempt);
                    break;
                }
                set_state(&task_inner, BusState::Reconnecting);
            }
            task_inner.reconnect_running.store(false, Ordering::SeqCst);
        });

        *inner.reconnect_task.lock().unwrap() = Some(handle);
    }

    /// Publish one envelope. Disconnected buses swallow the frame silently;
    /// transport failures are logged and flip the publisher into
    /// reconnecting.
    pub async fn publish(&self, event: &DetectionEvent) {
        let client = { self.inner.client.lock().await.clone() };
        let Some(client) = client else {
            return;
        };

        if client.connection_state() != async_nats::connection::State::Connected {
            set_state(&self.inner, BusState::Disconnected);
            if self.inner.auto_reconnect.load(Ordering::SeqCst) {
                Self::spawn_reconnect(&self.inner);
            }
            return;
        }

        let subject = subject_for(&event.stream_id);
        let payload = serialize_event(event);

        match client.publish(subject, payload.into()).await {
            Ok(()) => {
                self.inner.messages_published.fetch_add(1, Ordering::SeqCst);
                self.inner.last_publish_time.store(now_ms(), Ordering::SeqCst);
            }
            Err(e) => {
                warn!("Publish failed: {}", e);
                let err = PublishError::Publish {
                    details: e.to_string(),
                };
                record_error(&self.inner, &err);
            }
        }
    }

    /// Disconnect, stopping the reconnect task first.
    pub async fn disconnect(&self) {
        self.inner.reconnect_running.store(false, Ordering::SeqCst);
        if let Some(task) = self.inner.reconnect_task.lock().unwrap().take() {
            task.abort();
        }

        let mut client_guard = self.inner.client.lock().await;
        if let Some(client) = client_guard.take() {
            let _ = client.flush().await;
            info!("Disconnected from message bus");
        }
        set_state(&self.inner, BusState::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == BusState::Connected
    }

    pub fn state(&self) -> BusState {
        BusState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn url(&self) -> String {
        self.inner.url.lock().unwrap().clone()
    }

    /// Point the publisher at a different bus; reconnects on next use.
    pub async fn set_url(&self, url: impl Into<String>) {
        self.disconnect().await;
        *self.inner.url.lock().unwrap() = url.into();
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            messages_published: self.inner.messages_published.load(Ordering::SeqCst),
            last_publish_time: self.inner.last_publish_time.load(Ordering::SeqCst),
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::SeqCst),
            last_error: self.inner.last_error.lock().unwrap().clone(),
        }
    }
}

fn set_state(inner: &PublisherInner, state: BusState) {
    let old = inner.state.swap(state.as_u8(), Ordering::SeqCst);
    if old != state.as_u8() {
        debug!(
            "Bus state: {} -> {}",
            BusState::from_u8(old).as_str(),
            state.as_str()
        );
    }
}

fn record_error(inner: &PublisherInner, error: &PublishError) {
    *inner.last_error.lock().unwrap() = error.to_string();
}

/// Bus subject for one stream's envelopes.
pub fn subject_for(stream_id: &str) -> String {
    format!("stream.{stream_id}")
}

/// Serialize one envelope to the wire JSON.
///
/// Each detection carries its first matched event id (or null) under
/// `event`; keypoints appear as `[[x, y, v], ...]` when present; the
/// encoded image rides along base64-encoded under `image`.
pub fn serialize_event(event: &DetectionEvent) -> String {
    let detections: Vec<Value> = event
        .detections
        .iter()
        .map(|det| {
            let mut obj = json!({
                "class": det.class_name,
                "class_id": det.class_id,
                "confidence": det.confidence,
                "bbox": {
                    "x": det.bbox.x,
                    "y": det.bbox.y,
                    "width": det.bbox.width,
                    "height": det.bbox.height,
                },
                "event": det
                    .event_setting_ids
                    .first()
                    .map(|id| Value::String(id.clone()))
                    .unwrap_or(Value::Null),
            });

            if !det.keypoints.is_empty() {
                obj["keypoints"] = Value::Array(
                    det.keypoints
                        .iter()
                        .map(|kp| json!([kp.x, kp.y, kp.visible]))
                        .collect(),
                );
            }
            obj
        })
        .collect();

    let events: serde_json::Map<String, Value> = event
        .events
        .iter()
        .map(|(id, status)| {
            (
                id.clone(),
                json!({
                    "status": status.status.as_i32(),
                    "labels": status.labels,
                }),
            )
        })
        .collect();

    let mut envelope = json!({
        "stream_id": event.stream_id,
        "timestamp": event.timestamp,
        "frame_number": event.frame_number,
        "fps": event.fps,
        "width": event.width,
        "height": event.height,
        "detections": detections,
        "events": events,
    });

    if let Some(image) = &event.image_data {
        envelope["image"] = Value::String(BASE64.encode(image));
    }

    envelope.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Detection, EventLevel, EventStatus, Keypoint};
    use bytes::Bytes;

    fn sample_event() -> DetectionEvent {
        let mut event = DetectionEvent {
            stream_id: "cam-1".to_string(),
            timestamp: 1700000000000,
            frame_number: 42,
            fps: 29.5,
            width: 1920,
            height: 1080,
            ..DetectionEvent::default()
        };

        event.detections.push(Detection {
            class_name: "person".to_string(),
            class_id: 0,
            confidence: 0.9,
            bbox: BoundingBox {
                x: 10,
                y: 20,
                width: 30,
                height: 40,
            },
            keypoints: vec![Keypoint {
                x: 0.5,
                y: 0.5,
                visible: 0.8,
            }],
            event_setting_ids: vec!["roi-1".to_string(), "roi-2".to_string()],
        });
        event.detections.push(Detection {
            class_name: "car".to_string(),
            class_id: 2,
            confidence: 0.7,
            bbox: BoundingBox {
                x: 100,
                y: 100,
                width: 50,
                height: 25,
            },
            ..Detection::default()
        });

        event.events.insert(
            "line-1".to_string(),
            EventStatus {
                status: EventLevel::Warning,
                labels: vec!["person".to_string()],
            },
        );

        event
    }

    #[test]
    fn test_subject_format() {
        assert_eq!(subject_for("cam-1"), "stream.cam-1");
    }

    #[test]
    fn test_envelope_serialization() {
        let json: Value = serde_json::from_str(&serialize_event(&sample_event())).unwrap();

        assert_eq!(json["stream_id"], "cam-1");
        assert_eq!(json["frame_number"], 42);
        assert_eq!(json["width"], 1920);

        let dets = json["detections"].as_array().unwrap();
        assert_eq!(dets.len(), 2);

        // First matched event id rides along; no keypoints key when empty.
        assert_eq!(dets[0]["event"], "roi-1");
        assert_eq!(dets[0]["class"], "person");
        assert_eq!(dets[0]["bbox"]["width"], 30);
        assert_eq!(dets[0]["keypoints"][0][2], 0.800000011920929);
        assert_eq!(dets[1]["event"], Value::Null);
        assert!(dets[1].get("keypoints").is_none());

        assert_eq!(json["events"]["line-1"]["status"], 1);
        assert_eq!(json["events"]["line-1"]["labels"][0], "person");
        assert!(json.get("image").is_none());
    }

    #[test]
    fn test_envelope_image_base64() {
        let mut event = sample_event();
        event.image_data = Some(Bytes::from_static(b"\xff\xd8jpeg"));

        let json: Value = serde_json::from_str(&serialize_event(&event)).unwrap();
        let image = json["image"].as_str().unwrap();
        assert_eq!(BASE64.decode(image).unwrap(), b"\xff\xd8jpeg");
    }

    #[tokio::test]
    async fn test_publish_disconnected_is_silent_noop() {
        let publisher = Publisher::new(&NatsConfig::default());
        assert_eq!(publisher.state(), BusState::Disconnected);

        // No client: returns without error and counts nothing.
        publisher.publish(&sample_event()).await;
        assert_eq!(publisher.stats().messages_published, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let config = NatsConfig {
            url: "nats://127.0.0.1:1".to_string(),
            auto_reconnect: false,
            reconnect_interval_seconds: 1,
            connection_timeout_ms: 500,
        };
        let publisher = Publisher::new(&config);

        let result = publisher.connect().await;
        assert!(result.is_err());
        assert_eq!(publisher.state(), BusState::Disconnected);
        assert!(!publisher.stats().last_error.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let publisher = Publisher::new(&NatsConfig::default());
        publisher.disconnect().await;
        publisher.disconnect().await;
        assert_eq!(publisher.state(), BusState::Disconnected);
    }
}
