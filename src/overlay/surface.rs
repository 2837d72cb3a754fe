use anyhow::{anyhow, Context, Result};
use image::imageops;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::Path;

use super::font::draw_text;
use super::{OverlayStyle, Surface};
use crate::detect::BoundingBox;
use crate::frame::{Frame, FrameDimensions};

/// Raster surface backed by an `RgbImage`.
pub struct ImageSurface {
    canvas: RgbImage,
    attached: bool,
}

impl ImageSurface {
    pub fn new() -> Self {
        Self {
            canvas: RgbImage::new(0, 0),
            attached: true,
        }
    }

    pub fn canvas(&self) -> &RgbImage {
        &self.canvas
    }

    /// Mark the surface as gone. Later draw calls fail.
    pub fn detach(&mut self) {
        self.attached = false;
    }

    /// Write the current canvas to `path` (format from extension).
    pub fn save(&self, path: &Path) -> Result<()> {
        if self.canvas.width() == 0 || self.canvas.height() == 0 {
            return Err(anyhow!("surface has not been drawn yet"));
        }
        self.canvas
            .save(path)
            .with_context(|| format!("write snapshot {}", path.display()))
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.attached {
            Ok(())
        } else {
            Err(anyhow!("surface detached"))
        }
    }
}

impl Default for ImageSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl Surface for ImageSurface {
    fn is_attached(&self) -> bool {
        self.attached
    }

    fn dimensions(&self) -> FrameDimensions {
        FrameDimensions::new(self.canvas.width(), self.canvas.height())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.ensure_attached()?;
        if self.canvas.dimensions() != (width, height) {
            self.canvas = RgbImage::new(width, height);
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.ensure_attached()?;
        for pixel in self.canvas.pixels_mut() {
            *pixel = Rgb([0, 0, 0]);
        }
        Ok(())
    }

    fn draw_image(&mut self, frame: &Frame) -> Result<()> {
        self.ensure_attached()?;
        if let Some(view) = frame.view() {
            imageops::replace(&mut self.canvas, &view, 0, 0);
        }
        Ok(())
    }

    fn stroke_rect(&mut self, rect: BoundingBox, style: &OverlayStyle) -> Result<()> {
        self.ensure_attached()?;
        let (cw, ch) = self.canvas.dimensions();
        let finite = [rect.x, rect.y, rect.width, rect.height]
            .iter()
            .all(|v| v.is_finite());
        if !finite || cw == 0 || ch == 0 {
            log::trace!("skipping undrawable box {:?}", rect);
            return Ok(());
        }
        let line = style.line_width.min(cw.max(ch));
        // Edges far off the canvas are pulled in to just past the border,
        // where the stroke still lands outside.
        let margin = line as f32 + 1.0;
        let clamp_x = |v: f32| v.clamp(-margin, cw as f32 + margin).round() as i64;
        let clamp_y = |v: f32| v.clamp(-margin, ch as f32 + margin).round() as i64;
        let (left, right) = (clamp_x(rect.x), clamp_x(rect.x + rect.width));
        let (top, bottom) = (clamp_y(rect.y), clamp_y(rect.y + rect.height));
        let (w, h) = (right - left, bottom - top);
        // Center the stroke on the outline: half outside, half inside.
        let half = i64::from(line / 2);
        for k in 0..i64::from(line) {
            let inset = k - half;
            let (rw, rh) = (w - 2 * inset, h - 2 * inset);
            if rw <= 0 || rh <= 0 {
                break;
            }
            let (Ok(ox), Ok(oy)) = (i32::try_from(left + inset), i32::try_from(top + inset)) else {
                break;
            };
            let outline = Rect::at(ox, oy).of_size(rw as u32, rh as u32);
            draw_hollow_rect_mut(&mut self.canvas, outline, style.color);
        }
        Ok(())
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, style: &OverlayStyle) -> Result<()> {
        self.ensure_attached()?;
        draw_text(
            &mut self.canvas,
            text,
            x.round() as i32,
            y.round() as i32,
            style.font_px,
            style.color,
        );
        Ok(())
    }
}

/// One recorded surface call.
#[derive(Clone, Debug, PartialEq)]
pub enum DrawOp {
    Resize { width: u32, height: u32 },
    Clear,
    Image { sequence: u64 },
    StrokeRect(BoundingBox),
    FillText { text: String, x: f32, y: f32 },
}

/// Headless surface that records calls instead of drawing them.
#[derive(Debug)]
pub struct RecordingSurface {
    ops: Vec<DrawOp>,
    dimensions: FrameDimensions,
    attached: bool,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            dimensions: FrameDimensions::default(),
            attached: true,
        }
    }

    pub fn ops(&self) -> &[DrawOp] {
        &self.ops
    }

    pub fn detach(&mut self) {
        self.attached = false;
    }

    fn record(&mut self, op: DrawOp) -> Result<()> {
        if !self.attached {
            return Err(anyhow!("surface detached"));
        }
        self.ops.push(op);
        Ok(())
    }
}

impl Default for RecordingSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl Surface for RecordingSurface {
    fn is_attached(&self) -> bool {
        self.attached
    }

    fn dimensions(&self) -> FrameDimensions {
        self.dimensions
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.record(DrawOp::Resize { width, height })?;
        self.dimensions = FrameDimensions::new(width, height);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.record(DrawOp::Clear)
    }

    fn draw_image(&mut self, frame: &Frame) -> Result<()> {
        self.record(DrawOp::Image {
            sequence: frame.sequence,
        })
    }

    fn stroke_rect(&mut self, rect: BoundingBox, _style: &OverlayStyle) -> Result<()> {
        self.record(DrawOp::StrokeRect(rect))
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, _style: &OverlayStyle) -> Result<()> {
        self.record(DrawOp::FillText {
            text: text.to_string(),
            x,
            y,
        })
    }
}
