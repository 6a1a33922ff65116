//! Event topology evaluation: a compositor holds the parsed settings DAG
//! and evaluates ROI containment, line proximity, and angle violations
//! against each frame's detections.

pub mod geometry;
pub mod settings;

use crate::error::EventError;
use crate::types::{Detection, EventLevel, EventStatus};
use geometry::Point2D;
use settings::{DetectionPoint, EventSetting, EventType, LineDirection};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::info;

/// Keypoints below this visibility are ignored by line and angle checks.
const MIN_KEYPOINT_VISIBILITY: f32 = 0.3;

#[derive(Default)]
struct CompositorState {
    settings: HashMap<String, EventSetting>,
    terminal_events: Vec<String>,
}

/// Holds the current event settings and evaluates them per frame.
///
/// Stateless across frames: every check is a pure function of the current
/// settings and the frame's detections. Mutators take the write lock and
/// swap the whole state atomically; evaluators take the read lock.
#[derive(Default)]
pub struct EventCompositor {
    state: RwLock<CompositorState>,
}

impl EventCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all settings from a JSON document and return the terminal
    /// event ids.
    ///
    /// Prior settings are cleared before parsing, so a malformed document
    /// leaves the compositor empty rather than holding a stale topology.
    pub fn update_settings(&self, settings_json: &str) -> Result<Vec<String>, EventError> {
        let mut state = self.state.write().unwrap();
        *state = CompositorState::default();

        let mut parsed = settings::parse_settings(settings_json)?;
        settings::build_event_tree(&mut parsed);
        let terminals = settings::find_terminal_events(&parsed);

        info!(
            "Event settings loaded: {} events, {} terminals",
            parsed.len(),
            terminals.len()
        );

        state.settings = parsed;
        state.terminal_events = terminals.clone();
        Ok(terminals)
    }

    /// Remove every setting.
    pub fn clear_settings(&self) {
        let mut state = self.state.write().unwrap();
        *state = CompositorState::default();
        info!("Event settings cleared");
    }

    pub fn setting_count(&self) -> usize {
        self.state.read().unwrap().settings.len()
    }

    pub fn get_setting(&self, event_setting_id: &str) -> Option<EventSetting> {
        self.state
            .read()
            .unwrap()
            .settings
            .get(event_setting_id)
            .cloned()
    }

    pub fn terminal_events(&self) -> Vec<String> {
        self.state.read().unwrap().terminal_events.clone()
    }

    /// Tag each detection with every ROI it falls inside.
    ///
    /// A detection's anchor point (per the setting's detection point, feet
    /// by default) is tested against the polygon; matches from multiple
    /// regions accumulate as a union.
    pub fn check_events(&self, detections: &mut [Detection], frame_width: u32, frame_height: u32) {
        let state = self.state.read().unwrap();
        if state.settings.is_empty() || detections.is_empty() {
            return;
        }

        let mut roi_ids: Vec<&String> = state
            .settings
            .iter()
            .filter(|(_, s)| s.event_type == EventType::Roi)
            .map(|(id, _)| id)
            .collect();
        roi_ids.sort();

        for det in detections.iter_mut() {
            for id in &roi_ids {
                let setting = &state.settings[*id];

                if setting.points.len() < 3 || !setting.matches_target(&det.class_name) {
                    continue;
                }

                let anchor = detection_anchor(det, setting.detection_point, frame_width, frame_height);
                if geometry::point_in_polygon(anchor, &setting.points) {
                    if !det.event_setting_ids.contains(*id) {
                        det.event_setting_ids.push((*id).clone());
                    }
                }
            }
        }
    }

    /// Evaluate every line setting against the detections' keypoints.
    ///
    /// A keypoint on the line's danger side is DANGER; within the warning
    /// distance on the safe side, WARNING. `Both` direction has no danger
    /// side and caps at WARNING. Each event aggregates the maximum status
    /// across contributing detections.
    pub fn check_line_events(&self, detections: &[Detection]) -> HashMap<String, EventStatus> {
        let state = self.state.read().unwrap();
        let mut results = HashMap::new();

        for (id, setting) in &state.settings {
            if setting.event_type != EventType::Line || setting.points.len() < 2 {
                continue;
            }

            let a = setting.points[0];
            let b = setting.points[1];
            let mut status = EventStatus::default();

            for det in detections {
                if det.keypoints.is_empty() || !setting.matches_target(&det.class_name) {
                    continue;
                }

                let indices: Vec<usize> = if setting.keypoints.is_empty() {
                    (0..det.keypoints.len()).collect()
                } else {
                    setting.keypoints.clone()
                };

                for idx in indices {
                    let Some(kp) = det.keypoints.get(idx) else {
                        continue;
                    };
                    if kp.visible < MIN_KEYPOINT_VISIBILITY {
                        continue;
                    }

                    let p = Point2D::new(kp.x, kp.y);
                    let side = geometry::signed_side(a, b, p);
                    let distance = geometry::distance_to_line(a, b, p);

                    let level = match setting.direction {
                        LineDirection::A2B if side > 0.0 => EventLevel::Danger,
                        LineDirection::B2A if side < 0.0 => EventLevel::Danger,
                        _ if distance < setting.warning_distance => EventLevel::Warning,
                        _ => EventLevel::Safe,
                    };

                    status.raise(level, &det.class_name);
                }
            }

            results.insert(id.clone(), status);
        }

        results
    }

    /// Evaluate angle-violation settings: the angle between the detection's
    /// keypoint-1 -> keypoint-2 segment and the configured line, folded to
    /// acute, violates past the threshold.
    pub fn check_angle_violation_events(
        &self,
        detections: &[Detection],
    ) -> HashMap<String, EventStatus> {
        let state = self.state.read().unwrap();
        let mut results = HashMap::new();

        for (id, setting) in &state.settings {
            if setting.event_type != EventType::AngleViolation || setting.points.len() < 2 {
                continue;
            }

            let a = setting.points[0];
            let b = setting.points[1];
            let v_line = (b.x - a.x, b.y - a.y);
            let mut status = EventStatus::default();

            for det in detections {
                if det.keypoints.len() < 3 || !setting.matches_target(&det.class_name) {
                    continue;
                }

                let kp1 = det.keypoints[1];
                let kp2 = det.keypoints[2];
                if kp1.visible < MIN_KEYPOINT_VISIBILITY || kp2.visible < MIN_KEYPOINT_VISIBILITY {
                    continue;
                }

                let v_kp = (kp2.x - kp1.x, kp2.y - kp1.y);
                let Some(angle) = geometry::acute_angle_degrees(v_kp, v_line) else {
                    continue;
                };

                if angle > setting.angle_threshold {
                    status.raise(EventLevel::Danger, &det.class_name);
                } else {
                    status.raise(EventLevel::Safe, &det.class_name);
                }
            }

            results.insert(id.clone(), status);
        }

        results
    }
}

/// Anchor point of a detection's bbox, normalized to the frame.
fn detection_anchor(
    det: &Detection,
    point: DetectionPoint,
    frame_width: u32,
    frame_height: u32,
) -> Point2D {
    let x = det.bbox.x as f32;
    let y = det.bbox.y as f32;
    let w = det.bbox.width as f32;
    let h = det.bbox.height as f32;

    let (px, py) = match point {
        DetectionPoint::LeftTop => (x, y),
        DetectionPoint::CenterTop => (x + w / 2.0, y),
        DetectionPoint::RightTop => (x + w, y),
        DetectionPoint::LeftCenter => (x, y + h / 2.0),
        DetectionPoint::Center => (x + w / 2.0, y + h / 2.0),
        DetectionPoint::RightCenter => (x + w, y + h / 2.0),
        DetectionPoint::LeftBottom => (x, y + h),
        DetectionPoint::CenterBottom => (x + w / 2.0, y + h),
        DetectionPoint::RightBottom => (x + w, y + h),
    };

    Point2D::new(px / frame_width as f32, py / frame_height as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Keypoint};

    fn detection(class_name: &str, bbox: BoundingBox) -> Detection {
        Detection {
            class_name: class_name.to_string(),
            confidence: 0.9,
            bbox,
            ..Detection::default()
        }
    }

    fn with_keypoints(mut det: Detection, kps: &[(f32, f32, f32)]) -> Detection {
        det.keypoints = kps
            .iter()
            .map(|&(x, y, visible)| Keypoint { x, y, visible })
            .collect();
        det
    }

    fn roi_json(id: &str, targets: &str, detection_point: &str) -> String {
        format!(
            r#"{{"configs": [{{
                "eventSettingId": "{id}",
                "eventType": "ROI",
                "points": [[0.1, 0.1], [0.9, 0.1], [0.9, 0.9], [0.1, 0.9]],
                "targets": {targets},
                "detectionPoint": "{detection_point}"
            }}]}}"#
        )
    }

    #[test]
    fn test_roi_containment_tags_detection() {
        // 100x100 frame, person bbox (10,10,20,30): center-bottom at
        // (0.2, 0.4), inside the square region.
        let compositor = EventCompositor::new();
        compositor
            .update_settings(&roi_json("roi-1", r#"["person"]"#, "c:b"))
            .unwrap();

        let mut dets = vec![detection(
            "person",
            BoundingBox {
                x: 10,
                y: 10,
                width: 20,
                height: 30,
            },
        )];
        compositor.check_events(&mut dets, 100, 100);
        assert_eq!(dets[0].event_setting_ids, vec!["roi-1".to_string()]);
    }

    #[test]
    fn test_roi_misses_on_class() {
        let compositor = EventCompositor::new();
        compositor
            .update_settings(&roi_json("roi-1", r#"["car"]"#, "c:b"))
            .unwrap();

        let mut dets = vec![detection(
            "person",
            BoundingBox {
                x: 10,
                y: 10,
                width: 20,
                height: 30,
            },
        )];
        compositor.check_events(&mut dets, 100, 100);
        assert!(dets[0].event_setting_ids.is_empty());
    }

    #[test]
    fn test_multiple_rois_union() {
        let json = r#"{"configs": [
            {"eventSettingId": "roi-a", "eventType": "ROI",
             "points": [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]], "targets": []},
            {"eventSettingId": "roi-b", "eventType": "ROI",
             "points": [[0.0, 0.0], [0.5, 0.0], [0.5, 1.0], [0.0, 1.0]], "targets": []}
        ]}"#;
        let compositor = EventCompositor::new();
        compositor.update_settings(json).unwrap();

        let mut dets = vec![detection(
            "person",
            BoundingBox {
                x: 10,
                y: 10,
                width: 20,
                height: 30,
            },
        )];
        compositor.check_events(&mut dets, 100, 100);
        assert_eq!(
            dets[0].event_setting_ids,
            vec!["roi-a".to_string(), "roi-b".to_string()]
        );
    }

    #[test]
    fn test_roi_needs_three_points() {
        let json = r#"{"configs": [{"eventSettingId": "bad", "eventType": "ROI",
            "points": [[0.0, 0.0], [1.0, 1.0]], "targets": []}]}"#;
        let compositor = EventCompositor::new();
        compositor.update_settings(json).unwrap();

        let mut dets = vec![detection(
            "person",
            BoundingBox {
                x: 10,
                y: 10,
                width: 20,
                height: 30,
            },
        )];
        compositor.check_events(&mut dets, 100, 100);
        assert!(dets[0].event_setting_ids.is_empty());
    }

    fn line_json(id: &str, direction: &str) -> String {
        format!(
            r#"{{"configs": [{{
                "eventSettingId": "{id}",
                "eventType": "Line",
                "points": [[0.5, 0.0], [0.5, 1.0]],
                "targets": [],
                "direction": "{direction}",
                "warningDistance": 0.1,
                "keypoints": [1]
            }}]}}"#
        )
    }

    #[test]
    fn test_line_warning_and_safe_a2b() {
        let compositor = EventCompositor::new();
        compositor.update_settings(&line_json("line-1", "A2B")).unwrap();

        let near = with_keypoints(
            detection("person", BoundingBox::default()),
            &[(0.0, 0.0, 1.0), (0.55, 0.5, 1.0)],
        );
        let far = with_keypoints(
            detection("car", BoundingBox::default()),
            &[(0.0, 0.0, 1.0), (0.7, 0.5, 1.0)],
        );

        let results = compositor.check_line_events(&[near, far]);
        let status = &results["line-1"];
        assert_eq!(status.status, EventLevel::Warning);
        assert_eq!(status.labels, vec!["person".to_string()]);
    }

    #[test]
    fn test_line_danger_b2a() {
        let compositor = EventCompositor::new();
        compositor.update_settings(&line_json("line-1", "B2A")).unwrap();

        let near = with_keypoints(
            detection("person", BoundingBox::default()),
            &[(0.0, 0.0, 1.0), (0.55, 0.5, 1.0)],
        );

        let results = compositor.check_line_events(&[near]);
        assert_eq!(results["line-1"].status, EventLevel::Danger);
        assert_eq!(results["line-1"].labels, vec!["person".to_string()]);
    }

    #[test]
    fn test_line_both_never_dangers() {
        let compositor = EventCompositor::new();
        compositor.update_settings(&line_json("line-1", "BOTH")).unwrap();

        // Points on either side, right on the line, near and far.
        for kp in [(0.55, 0.5), (0.45, 0.5), (0.5, 0.5), (0.95, 0.5)] {
            let det = with_keypoints(
                detection("person", BoundingBox::default()),
                &[(0.0, 0.0, 1.0), (kp.0, kp.1, 1.0)],
            );
            let results = compositor.check_line_events(&[det]);
            assert!(results["line-1"].status < EventLevel::Danger);
        }
    }

    #[test]
    fn test_line_ignores_low_visibility_and_missing_index() {
        let compositor = EventCompositor::new();
        compositor.update_settings(&line_json("line-1", "A2B")).unwrap();

        // Danger-side keypoint, but invisible.
        let hidden = with_keypoints(
            detection("person", BoundingBox::default()),
            &[(0.0, 0.0, 1.0), (0.45, 0.5, 0.2)],
        );
        // Only one keypoint; index 1 does not exist.
        let short = with_keypoints(detection("person", BoundingBox::default()), &[(0.45, 0.5, 1.0)]);

        let results = compositor.check_line_events(&[hidden, short]);
        assert_eq!(results["line-1"].status, EventLevel::Safe);
        assert!(results["line-1"].labels.is_empty());
    }

    #[test]
    fn test_line_empty_keypoint_filter_tests_all() {
        let json = r#"{"configs": [{
            "eventSettingId": "line-1", "eventType": "Line",
            "points": [[0.5, 0.0], [0.5, 1.0]], "targets": [],
            "direction": "A2B", "warningDistance": 0.1
        }]}"#;
        let compositor = EventCompositor::new();
        compositor.update_settings(json).unwrap();

        // Danger side (s > 0 for A2B) on the first keypoint.
        let det = with_keypoints(
            detection("person", BoundingBox::default()),
            &[(0.45, 0.5, 1.0)],
        );
        let results = compositor.check_line_events(&[det]);
        assert_eq!(results["line-1"].status, EventLevel::Danger);
    }

    #[test]
    fn test_angle_violation() {
        let json = r#"{"configs": [{
            "eventSettingId": "angle-1", "eventType": "AngleViolation",
            "points": [[0.0, 0.5], [1.0, 0.5]], "targets": [],
            "angleThreshold": 30.0
        }]}"#;
        let compositor = EventCompositor::new();
        compositor.update_settings(json).unwrap();

        // Keypoints 1->2 vertical: 90 degrees to the horizontal line.
        let violating = with_keypoints(
            detection("forklift", BoundingBox::default()),
            &[(0.0, 0.0, 1.0), (0.5, 0.2, 1.0), (0.5, 0.8, 1.0)],
        );
        let results = compositor.check_angle_violation_events(&[violating]);
        assert_eq!(results["angle-1"].status, EventLevel::Danger);
        assert_eq!(results["angle-1"].labels, vec!["forklift".to_string()]);

        // Nearly parallel: under the threshold.
        let aligned = with_keypoints(
            detection("forklift", BoundingBox::default()),
            &[(0.0, 0.0, 1.0), (0.2, 0.5, 1.0), (0.8, 0.55, 1.0)],
        );
        let results = compositor.check_angle_violation_events(&[aligned]);
        assert_eq!(results["angle-1"].status, EventLevel::Safe);
    }

    #[test]
    fn test_angle_needs_three_visible_keypoints() {
        let json = r#"{"configs": [{
            "eventSettingId": "angle-1", "eventType": "AngleViolation",
            "points": [[0.0, 0.5], [1.0, 0.5]], "targets": [],
            "angleThreshold": 10.0
        }]}"#;
        let compositor = EventCompositor::new();
        compositor.update_settings(json).unwrap();

        let two_kps = with_keypoints(
            detection("forklift", BoundingBox::default()),
            &[(0.5, 0.2, 1.0), (0.5, 0.8, 1.0)],
        );
        let hidden = with_keypoints(
            detection("forklift", BoundingBox::default()),
            &[(0.0, 0.0, 1.0), (0.5, 0.2, 0.1), (0.5, 0.8, 1.0)],
        );

        let results = compositor.check_angle_violation_events(&[two_kps, hidden]);
        assert_eq!(results["angle-1"].status, EventLevel::Safe);
    }

    #[test]
    fn test_update_returns_terminals_and_failure_clears() {
        let json = r#"{"configs": [
            {"eventSettingId": "parent", "eventType": "ROI"},
            {"eventSettingId": "child", "eventType": "Line", "parentId": "parent"},
            {"eventSettingId": "heatmap", "eventType": "HM"}
        ]}"#;
        let compositor = EventCompositor::new();
        let terminals = compositor.update_settings(json).unwrap();
        assert_eq!(terminals, vec!["child".to_string()]);
        assert_eq!(compositor.setting_count(), 3);

        // A bad document clears everything first and leaves it cleared.
        assert!(compositor.update_settings("garbage").is_err());
        assert_eq!(compositor.setting_count(), 0);
        assert!(compositor.terminal_events().is_empty());
    }

    #[test]
    fn test_clear_settings() {
        let compositor = EventCompositor::new();
        compositor
            .update_settings(&roi_json("roi-1", r#"[]"#, "c:b"))
            .unwrap();
        assert_eq!(compositor.setting_count(), 1);
        compositor.clear_settings();
        assert_eq!(compositor.setting_count(), 0);
        assert!(compositor.get_setting("roi-1").is_none());
    }

    #[test]
    fn test_unevaluated_kinds_are_retained_not_evaluated() {
        let json = r#"{"configs": [
            {"eventSettingId": "and-1", "eventType": "And",
             "points": [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]], "targets": []}
        ]}"#;
        let compositor = EventCompositor::new();
        compositor.update_settings(json).unwrap();
        assert!(compositor.get_setting("and-1").is_some());

        let mut dets = vec![detection(
            "person",
            BoundingBox {
                x: 10,
                y: 10,
                width: 20,
                height: 30,
            },
        )];
        compositor.check_events(&mut dets, 100, 100);
        assert!(dets[0].event_setting_ids.is_empty());
        assert!(compositor.check_line_events(&dets).is_empty());
    }
}
