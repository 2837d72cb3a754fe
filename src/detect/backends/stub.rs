use anyhow::{anyhow, Result};

use crate::capture::synthetic::OBJECT_LUMA;
use crate::detect::backend::{Detector, ModelLoader};
use crate::detect::result::{BoundingBox, Detection, DetectionList};
use crate::detect::DetectorSettings;
use crate::frame::Frame;

const BRIGHT_THRESHOLD: u8 = OBJECT_LUMA - 5;

/// Stub backend for testing and hardware-free runs.
///
/// In synthetic mode it reports the bounding box of near-white pixels (the
/// object drawn by the synthetic camera) under a fixed label. In scripted
/// mode it replays a fixed sequence of detection lists.
pub struct StubBackend {
    mode: StubMode,
    calls: u64,
    fail_every: Option<u64>,
}

enum StubMode {
    Synthetic { label: String, confidence: f32 },
    Scripted { script: Vec<DetectionList> },
}

impl StubBackend {
    pub fn synthetic(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            mode: StubMode::Synthetic {
                label: label.into(),
                confidence,
            },
            calls: 0,
            fail_every: None,
        }
    }

    /// Replays `script` in order, wrapping around. An empty script always
    /// returns an empty list.
    pub fn scripted(script: Vec<DetectionList>) -> Self {
        Self {
            mode: StubMode::Scripted { script },
            calls: 0,
            fail_every: None,
        }
    }

    /// Fail every `n`th call (simulates transient inference errors).
    pub fn with_failure_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::scripted(Vec::new())
    }
}

impl Detector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionList> {
        self.calls += 1;
        if self.fail_every.is_some_and(|n| self.calls % n == 0) {
            return Err(anyhow!("stub inference failure on call {}", self.calls));
        }

        match &self.mode {
            StubMode::Synthetic { label, confidence } => Ok(bright_region(frame)
                .map(|bbox| vec![Detection::new(label.clone(), *confidence, bbox)])
                .unwrap_or_default()),
            StubMode::Scripted { script } => {
                if script.is_empty() {
                    return Ok(Vec::new());
                }
                let index = ((self.calls - 1) % script.len() as u64) as usize;
                Ok(script[index].clone())
            }
        }
    }
}

fn bright_region(frame: &Frame) -> Option<BoundingBox> {
    let view = frame.view()?;
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0u32;
    let mut max_y = 0u32;
    let mut found = false;

    for (x, y, pixel) in view.enumerate_pixels() {
        if pixel.0.iter().all(|&c| c >= BRIGHT_THRESHOLD) {
            found = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }

    found.then(|| {
        BoundingBox::new(
            min_x as f32,
            min_y as f32,
            (max_x - min_x + 1) as f32,
            (max_y - min_y + 1) as f32,
        )
    })
}

/// Loader for the stub backend.
pub struct StubLoader {
    label: String,
    confidence: f32,
    fail_every: u64,
}

impl StubLoader {
    pub fn new(settings: &DetectorSettings) -> Self {
        Self {
            label: settings.stub_label.clone(),
            confidence: settings.stub_confidence,
            fail_every: settings.stub_fail_every,
        }
    }
}

impl ModelLoader for StubLoader {
    fn name(&self) -> &str {
        "stub"
    }

    fn load(&self) -> Result<Box<dyn Detector>> {
        Ok(Box::new(
            StubBackend::synthetic(self.label.clone(), self.confidence)
                .with_failure_every(self.fail_every),
        ))
    }
}
