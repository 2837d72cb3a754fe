//! Object detection.
//!
//! The loop sees models only through the `Detector` capability. Concrete
//! backends are picked by name from `DetectorSettings`:
//! - `stub` synthetic/scripted detector (always available)
//! - `tract` ONNX models via tract (feature: backend-tract)

mod backend;
mod backends;
pub mod labels;
mod result;

use anyhow::{anyhow, Result};
use std::path::PathBuf;

pub use backend::{Detector, ModelLoader};
pub use backends::{StubBackend, StubLoader};
#[cfg(feature = "backend-tract")]
pub use backends::{TractBackend, TractLoader};
pub use result::{BoundingBox, Detection, DetectionList};

pub const KNOWN_BACKENDS: &[&str] = &["stub", "tract"];

/// Detector selection and tuning.
#[derive(Clone, Debug)]
pub struct DetectorSettings {
    /// Backend name, one of `KNOWN_BACKENDS`.
    pub backend: String,
    /// Model file for file-backed backends.
    pub model_path: Option<PathBuf>,
    /// Square model input side in pixels.
    pub input_size: u32,
    /// Minimum score a backend reports.
    pub score_threshold: f32,
    /// Label the stub backend assigns to the synthetic object.
    pub stub_label: String,
    pub stub_confidence: f32,
    /// Stub only: fail every Nth inference (0 disables).
    pub stub_fail_every: u64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: "stub".to_string(),
            model_path: None,
            input_size: 300,
            score_threshold: 0.5,
            stub_label: "cell phone".to_string(),
            stub_confidence: 0.9,
            stub_fail_every: 0,
        }
    }
}

/// Build the loader for the configured backend. Nothing is loaded yet.
pub fn model_loader(settings: &DetectorSettings) -> Result<Box<dyn ModelLoader>> {
    match settings.backend.as_str() {
        "stub" => Ok(Box::new(StubLoader::new(settings))),
        #[cfg(feature = "backend-tract")]
        "tract" => Ok(Box::new(TractLoader::new(settings)?)),
        #[cfg(not(feature = "backend-tract"))]
        "tract" => Err(anyhow!("tract backend requires the backend-tract feature")),
        other => Err(anyhow!(
            "unknown detector backend '{}' (expected one of {:?})",
            other,
            KNOWN_BACKENDS
        )),
    }
}
