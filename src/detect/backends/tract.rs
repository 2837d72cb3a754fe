#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::imageops::{resize, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::{Detector, ModelLoader};
use crate::detect::labels::label_for;
use crate::detect::result::{BoundingBox, Detection, DetectionList};
use crate::detect::DetectorSettings;
use crate::frame::Frame;

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>>;

/// Tract-based backend for SSD-style ONNX detectors.
///
/// Expected model signature:
/// - input 0: `f32[1, 3, S, S]`, RGB scaled to `0..1`
/// - output 0: `f32[1, N, 4]` boxes as normalized `(x1, y1, x2, y2)`
/// - output 1: `f32[1, N]` scores
/// - output 2: `[1, N]` COCO class ids (f32 or i64)
pub struct TractBackend {
    model: RunnableModel,
    input_size: u32,
    score_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            score_threshold: 0.5,
        })
    }

    /// Override the default score threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let view = frame
            .view()
            .ok_or_else(|| anyhow!("frame {} has no dimensions", frame.sequence))?;
        let resized = resize(&view, self.input_size, self.input_size, FilterType::Triangle);
        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<DetectionList> {
        if outputs.len() < 3 {
            return Err(anyhow!(
                "expected 3 model outputs (boxes, scores, classes), got {}",
                outputs.len()
            ));
        }
        let boxes = outputs[0]
            .to_array_view::<f32>()
            .context("boxes output was not f32")?;
        let scores = outputs[1]
            .to_array_view::<f32>()
            .context("scores output was not f32")?;
        let classes = class_ids(&outputs[2])?;

        let count = scores.len().min(classes.len());
        if boxes.len() < count * 4 {
            return Err(anyhow!(
                "boxes output holds {} values for {} detections",
                boxes.len(),
                count
            ));
        }

        let width = frame.width as f32;
        let height = frame.height as f32;
        let coords: Vec<f32> = boxes.iter().copied().collect();
        let mut detections = Vec::new();
        for (i, (&score, &class_id)) in scores.iter().zip(classes.iter()).enumerate() {
            if score < self.score_threshold {
                continue;
            }
            let Some(label) = label_for(class_id) else {
                log::debug!("TractBackend: dropping unknown class id {}", class_id);
                continue;
            };
            let b = &coords[i * 4..i * 4 + 4];
            let x1 = b[0].clamp(0.0, 1.0) * width;
            let y1 = b[1].clamp(0.0, 1.0) * height;
            let x2 = b[2].clamp(0.0, 1.0) * width;
            let y2 = b[3].clamp(0.0, 1.0) * height;
            detections.push(Detection::new(
                label,
                score,
                BoundingBox::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0)),
            ));
        }
        Ok(detections)
    }
}

fn class_ids(tensor: &Tensor) -> Result<Vec<usize>> {
    if let Ok(view) = tensor.to_array_view::<i64>() {
        return Ok(view.iter().map(|&id| id.max(0) as usize).collect());
    }
    let view = tensor
        .to_array_view::<f32>()
        .context("classes output was neither i64 nor f32")?;
    Ok(view.iter().map(|&id| id.max(0.0) as usize).collect())
}

impl Detector for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionList> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }
}

/// Loader for ONNX models on disk.
pub struct TractLoader {
    model_path: PathBuf,
    input_size: u32,
    score_threshold: f32,
}

impl TractLoader {
    pub fn new(settings: &DetectorSettings) -> Result<Self> {
        let model_path = settings
            .model_path
            .clone()
            .ok_or_else(|| anyhow!("tract backend requires detector.model_path"))?;
        Ok(Self {
            model_path,
            input_size: settings.input_size,
            score_threshold: settings.score_threshold,
        })
    }
}

impl ModelLoader for TractLoader {
    fn name(&self) -> &str {
        "tract"
    }

    fn load(&self) -> Result<Box<dyn Detector>> {
        let backend = TractBackend::new(&self.model_path, self.input_size)?
            .with_threshold(self.score_threshold);
        log::info!(
            "TractBackend: loaded {} ({}x{} input)",
            self.model_path.display(),
            self.input_size,
            self.input_size
        );
        Ok(Box::new(backend))
    }
}
