//! COCO class labels.
//!
//! Index order matches the 80-class COCO detection heads (SSD, YOLO, DETR
//! exports). The label strings are the ones users put in alert triggers,
//! e.g. `"cell phone"`.

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

pub fn label_for(class_id: usize) -> Option<&'static str> {
    COCO_LABELS.get(class_id).copied()
}

pub fn is_known_label(label: &str) -> bool {
    COCO_LABELS.contains(&label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_matches_coco_order() {
        assert_eq!(label_for(0), Some("person"));
        assert_eq!(label_for(41), Some("cup"));
        assert_eq!(label_for(67), Some("cell phone"));
        assert_eq!(label_for(80), None);
        assert!(is_known_label("cell phone"));
        assert!(!is_known_label("Cell Phone"));
    }
}
