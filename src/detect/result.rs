/// Axis-aligned box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// One object reported by the model.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_label: String,
    /// Model score in `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    /// Build a detection. Confidence is clamped into `[0, 1]`; NaN becomes 0.
    pub fn new(class_label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            class_label: class_label.into(),
            confidence,
            bbox,
        }
    }

    /// Confidence as a whole percentage, rounded half up.
    pub fn percent(&self) -> u32 {
        (self.confidence * 100.0).round() as u32
    }
}

/// Detections in model output order. No ranking is implied.
pub type DetectionList = Vec<Detection>;
