/// COCO 80-class label table, the fallback when a model carries no
/// configured label list or a class id falls outside it.
pub const COCO_LABELS: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// Resolve a class id to a display name: configured labels first, COCO
/// table next, `"object"` last.
pub fn class_name(labels: &[String], class_id: i32) -> String {
    if class_id >= 0 {
        let idx = class_id as usize;
        if let Some(name) = labels.get(idx) {
            return name.clone();
        }
        if let Some(name) = COCO_LABELS.get(idx) {
            return (*name).to_string();
        }
    }
    "object".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_name_resolution() {
        let labels = vec!["helmet".to_string(), "vest".to_string()];
        assert_eq!(class_name(&labels, 0), "helmet");
        assert_eq!(class_name(&labels, 1), "vest");
        // Past the configured list, fall through to COCO.
        assert_eq!(class_name(&labels, 2), "car");
        // Past everything: generic.
        assert_eq!(class_name(&labels, 500), "object");
        assert_eq!(class_name(&[], -1), "object");
    }

    #[test]
    fn test_coco_table_shape() {
        assert_eq!(COCO_LABELS.len(), 80);
        assert_eq!(COCO_LABELS[0], "person");
        assert_eq!(COCO_LABELS[79], "toothbrush");
    }
}
