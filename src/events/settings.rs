//! Event-settings model and JSON parsing.
//!
//! Settings arrive as a `{"configs": [...]}` document. Entries without an
//! `eventSettingId` are skipped; everything else defaults. The parent/child
//! DAG is derived from `parentId` after parsing.

use crate::error::EventError;
use crate::events::geometry::Point2D;
use serde_json::Value;
use std::collections::HashMap;

/// Closed set of event kinds. Only ROI, Line, and AngleViolation are
/// evaluated; the rest are parsed and retained for the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventType {
    Roi,
    /// Proximity and side only. Crossing needs cross-frame identity, which
    /// this daemon does not track.
    Line,
    AngleViolation,
    And,
    Or,
    Speed,
    Hm,
    Filter,
    EnEx,
    Alarm,
    #[default]
    Unknown,
}

impl EventType {
    pub fn parse(s: &str) -> EventType {
        match s.to_ascii_lowercase().as_str() {
            "roi" => EventType::Roi,
            "line" => EventType::Line,
            "angleviolation" => EventType::AngleViolation,
            "and" => EventType::And,
            "or" => EventType::Or,
            "speed" => EventType::Speed,
            "hm" => EventType::Hm,
            "filter" => EventType::Filter,
            "enex" => EventType::EnEx,
            "alarm" => EventType::Alarm,
            _ => EventType::Unknown,
        }
    }
}

/// Which of the nine canonical bbox positions anchors a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionPoint {
    LeftTop,
    CenterTop,
    RightTop,
    LeftCenter,
    Center,
    RightCenter,
    LeftBottom,
    /// Default: the feet position.
    #[default]
    CenterBottom,
    RightBottom,
}

impl DetectionPoint {
    pub fn parse(s: &str) -> DetectionPoint {
        match s {
            "l:t" => DetectionPoint::LeftTop,
            "c:t" => DetectionPoint::CenterTop,
            "r:t" => DetectionPoint::RightTop,
            "l:c" => DetectionPoint::LeftCenter,
            "c:c" => DetectionPoint::Center,
            "r:c" => DetectionPoint::RightCenter,
            "l:b" => DetectionPoint::LeftBottom,
            "c:b" => DetectionPoint::CenterBottom,
            "r:b" => DetectionPoint::RightBottom,
            _ => DetectionPoint::CenterBottom,
        }
    }
}

/// Which side of a directed line counts as crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineDirection {
    A2B,
    B2A,
    #[default]
    Both,
}

impl LineDirection {
    pub fn parse(s: &str) -> LineDirection {
        match s {
            "A2B" => LineDirection::A2B,
            "B2A" => LineDirection::B2A,
            _ => LineDirection::Both,
        }
    }
}

/// One parsed event setting.
#[derive(Debug, Clone, Default)]
pub struct EventSetting {
    pub event_setting_id: String,
    pub event_setting_name: String,
    pub event_type: EventType,
    pub parent_id: String,

    /// Polygon for ROI, two endpoints for Line/AngleViolation. Normalized
    /// `[0, 1]` coordinates.
    pub points: Vec<Point2D>,

    /// Target class labels; empty means every detection matches.
    pub targets: Vec<String>,

    /// ROI residency condition in seconds. Parsed, not evaluated.
    pub timeout: f32,
    pub detection_point: DetectionPoint,

    pub direction: LineDirection,
    /// Keypoint indices tested against the line; empty means all.
    pub keypoints: Vec<usize>,
    /// Normalized distance inside which a non-crossing point warns.
    pub warning_distance: f32,
    /// Degrees past which an orientation counts as a violation.
    pub angle_threshold: f32,

    // And/Or, Speed, HM and Alarm options: parsed and retained.
    pub in_order: bool,
    pub ncond: String,
    pub turn: i32,
    pub regen_interval: f32,
    pub ext: String,

    /// Child setting ids, derived from `parent_id` after parsing.
    pub children: Vec<String>,
}

impl EventSetting {
    pub fn matches_target(&self, class_name: &str) -> bool {
        self.targets.is_empty()
            || self
                .targets
                .iter()
                .any(|t| t.eq_ignore_ascii_case(class_name))
    }
}

fn is_all(label: &str) -> bool {
    label.eq_ignore_ascii_case("all")
}

/// `targets` can be an array of labels, a single string, or the legacy
/// `target.label` object form. The "ALL" sentinel anywhere collapses the
/// filter to match-everything (an empty list).
fn parse_targets(config: &Value) -> Vec<String> {
    if let Some(targets) = config.get("targets") {
        match targets {
            Value::String(s) => {
                if is_all(s) {
                    return Vec::new();
                }
                return vec![s.clone()];
            }
            Value::Array(arr) => {
                let labels: Vec<String> = arr
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                if labels.iter().any(|l| is_all(l)) {
                    return Vec::new();
                }
                return labels;
            }
            _ => return Vec::new(),
        }
    }

    if let Some(label) = config.pointer("/target/label").and_then(Value::as_str) {
        if !is_all(label) {
            return vec![label.to_string()];
        }
    }

    Vec::new()
}

fn parse_points(config: &Value) -> Vec<Point2D> {
    let mut points = Vec::new();
    if let Some(arr) = config.get("points").and_then(Value::as_array) {
        for point in arr {
            if let Some(pair) = point.as_array() {
                if pair.len() >= 2 {
                    if let (Some(x), Some(y)) = (pair[0].as_f64(), pair[1].as_f64()) {
                        points.push(Point2D::new(x as f32, y as f32));
                    }
                }
            }
        }
    }
    points
}

fn parse_keypoint_indices(config: &Value) -> Vec<usize> {
    config
        .get("keypoints")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_u64)
                .map(|v| v as usize)
                .collect()
        })
        .unwrap_or_default()
}

fn str_field(config: &Value, key: &str) -> String {
    config
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn f32_field(config: &Value, key: &str, default: f32) -> f32 {
    config
        .get(key)
        .and_then(Value::as_f64)
        .map(|v| v as f32)
        .unwrap_or(default)
}

/// Parse a settings document into a map keyed by setting id.
pub fn parse_settings(json: &str) -> Result<HashMap<String, EventSetting>, EventError> {
    let value: Value = serde_json::from_str(json).map_err(|e| EventError::Parse {
        details: e.to_string(),
    })?;

    let configs = value
        .get("configs")
        .and_then(Value::as_array)
        .ok_or_else(|| EventError::Parse {
            details: "missing configs array".to_string(),
        })?;

    let mut settings = HashMap::new();

    for config in configs {
        let Some(id) = config.get("eventSettingId").and_then(Value::as_str) else {
            continue;
        };

        let setting = EventSetting {
            event_setting_id: id.to_string(),
            event_setting_name: str_field(config, "eventSettingName"),
            event_type: EventType::parse(&str_field(config, "eventType")),
            parent_id: str_field(config, "parentId"),
            points: parse_points(config),
            targets: parse_targets(config),
            timeout: f32_field(config, "timeout", 0.0),
            detection_point: DetectionPoint::parse(&str_field(config, "detectionPoint")),
            direction: LineDirection::parse(&str_field(config, "direction")),
            keypoints: parse_keypoint_indices(config),
            warning_distance: f32_field(config, "warningDistance", 0.0),
            angle_threshold: f32_field(config, "angleThreshold", 0.0),
            in_order: config
                .get("inOrder")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ncond: str_field(config, "ncond"),
            turn: config.get("turn").and_then(Value::as_i64).unwrap_or(0) as i32,
            regen_interval: f32_field(config, "regenInterval", 60.0),
            ext: str_field(config, "ext"),
            children: Vec::new(),
        };

        settings.insert(setting.event_setting_id.clone(), setting);
    }

    Ok(settings)
}

/// Fill every setting's `children` from the `parent_id` links. Links to
/// unknown parents are ignored.
pub fn build_event_tree(settings: &mut HashMap<String, EventSetting>) {
    let links: Vec<(String, String)> = settings
        .values()
        .filter(|s| !s.parent_id.is_empty())
        .map(|s| (s.parent_id.clone(), s.event_setting_id.clone()))
        .collect();

    for (parent, child) in links {
        if let Some(parent_setting) = settings.get_mut(&parent) {
            parent_setting.children.push(child);
        }
    }
}

/// Terminal events: no children, and a kind that warrants reporting.
pub fn find_terminal_events(settings: &HashMap<String, EventSetting>) -> Vec<String> {
    let mut terminals: Vec<String> = settings
        .values()
        .filter(|s| {
            s.children.is_empty()
                && s.event_type != EventType::Filter
                && s.event_type != EventType::Hm
        })
        .map(|s| s.event_setting_id.clone())
        .collect();
    terminals.sort();
    terminals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_setting() {
        let json = r#"{"configs": [{
            "eventSettingId": "evt-1",
            "eventSettingName": "loading dock",
            "eventType": "ROI",
            "parentId": "",
            "points": [[0.1, 0.1], [0.9, 0.1], [0.9, 0.9]],
            "targets": ["Person", "Forklift"],
            "timeout": 2.5,
            "detectionPoint": "c:c",
            "direction": "A2B",
            "keypoints": [1, 2],
            "warningDistance": 0.1,
            "angleThreshold": 30.0,
            "inOrder": true,
            "ncond": ">=2",
            "turn": 1,
            "regenInterval": 15.0,
            "ext": "siren"
        }]}"#;

        let settings = parse_settings(json).unwrap();
        let s = &settings["evt-1"];
        assert_eq!(s.event_setting_name, "loading dock");
        assert_eq!(s.event_type, EventType::Roi);
        assert_eq!(s.points.len(), 3);
        assert_eq!(s.targets, vec!["Person".to_string(), "Forklift".to_string()]);
        assert_eq!(s.detection_point, DetectionPoint::Center);
        assert_eq!(s.direction, LineDirection::A2B);
        assert_eq!(s.keypoints, vec![1, 2]);
        assert!((s.warning_distance - 0.1).abs() < 1e-6);
        assert!((s.angle_threshold - 30.0).abs() < 1e-6);
        assert!(s.in_order);
        assert_eq!(s.ncond, ">=2");
        assert_eq!(s.turn, 1);
        assert!((s.regen_interval - 15.0).abs() < 1e-6);
        assert_eq!(s.ext, "siren");
    }

    #[test]
    fn test_targets_all_variants_match_everything() {
        for targets in [r#""ALL""#, r#"["ALL"]"#, r#"[]"#, r#""all""#] {
            let json = format!(
                r#"{{"configs": [{{"eventSettingId": "e", "eventType": "ROI", "targets": {targets}}}]}}"#
            );
            let settings = parse_settings(&json).unwrap();
            assert!(settings["e"].targets.is_empty(), "targets: {targets}");
            assert!(settings["e"].matches_target("anything"));
        }
    }

    #[test]
    fn test_targets_single_string_and_legacy_object() {
        let json = r#"{"configs": [{"eventSettingId": "e", "targets": "person"}]}"#;
        assert_eq!(parse_settings(json).unwrap()["e"].targets, vec!["person"]);

        let json = r#"{"configs": [{"eventSettingId": "e", "target": {"label": "car"}}]}"#;
        assert_eq!(parse_settings(json).unwrap()["e"].targets, vec!["car"]);
    }

    #[test]
    fn test_target_matching_case_insensitive() {
        let mut setting = EventSetting::default();
        setting.targets = vec!["Person".to_string()];
        assert!(setting.matches_target("person"));
        assert!(setting.matches_target("PERSON"));
        assert!(!setting.matches_target("car"));
    }

    #[test]
    fn test_missing_id_skipped_and_defaults_applied() {
        let json = r#"{"configs": [
            {"eventType": "ROI"},
            {"eventSettingId": "kept"}
        ]}"#;
        let settings = parse_settings(json).unwrap();
        assert_eq!(settings.len(), 1);

        let s = &settings["kept"];
        assert_eq!(s.event_type, EventType::Unknown);
        assert_eq!(s.detection_point, DetectionPoint::CenterBottom);
        assert_eq!(s.direction, LineDirection::Both);
        assert!((s.regen_interval - 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(parse_settings("not json").is_err());
        assert!(parse_settings(r#"{"no_configs": true}"#).is_err());
    }

    #[test]
    fn test_tree_and_terminals() {
        let json = r#"{"configs": [
            {"eventSettingId": "root", "eventType": "Filter"},
            {"eventSettingId": "mid", "eventType": "ROI", "parentId": "root"},
            {"eventSettingId": "leaf-a", "eventType": "Line", "parentId": "mid"},
            {"eventSettingId": "leaf-b", "eventType": "HM", "parentId": "mid"},
            {"eventSettingId": "orphan", "eventType": "ROI", "parentId": "missing"}
        ]}"#;

        let mut settings = parse_settings(json).unwrap();
        build_event_tree(&mut settings);

        assert_eq!(settings["root"].children, vec!["mid".to_string()]);
        let mut mid_children = settings["mid"].children.clone();
        mid_children.sort();
        assert_eq!(mid_children, vec!["leaf-a".to_string(), "leaf-b".to_string()]);

        // leaf-b is HM, root is a Filter with children, mid has children:
        // terminals are the Line leaf and the orphan.
        let terminals = find_terminal_events(&settings);
        assert_eq!(terminals, vec!["leaf-a".to_string(), "orphan".to_string()]);
    }

    #[test]
    fn test_event_type_parse_cases() {
        assert_eq!(EventType::parse("ROI"), EventType::Roi);
        assert_eq!(EventType::parse("roi"), EventType::Roi);
        assert_eq!(EventType::parse("AngleViolation"), EventType::AngleViolation);
        assert_eq!(EventType::parse("EnEx"), EventType::EnEx);
        assert_eq!(EventType::parse("whatever"), EventType::Unknown);
    }
}
