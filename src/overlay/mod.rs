//! Overlay rendering.
//!
//! Every pass repaints the whole surface: resize to the frame, clear, draw
//! the frame as background, then one box and one label per detection in
//! list order. There is no dirty-rect tracking because boxes can appear and
//! disappear anywhere between frames.

mod font;
mod surface;

use anyhow::Result;
use image::Rgb;

use crate::detect::{BoundingBox, Detection};
use crate::frame::{Frame, FrameDimensions};

pub use font::{text_width, GLYPH_HEIGHT};
pub use surface::{DrawOp, ImageSurface, RecordingSurface};

/// Labels sit this far above their box.
pub const LABEL_LIFT: f32 = 5.0;
/// Minimum label baseline, measured from the surface top.
pub const LABEL_MIN_BASELINE: f32 = 10.0;

/// Fixed style shared by every box and label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverlayStyle {
    pub color: Rgb<u8>,
    pub line_width: u32,
    pub font_px: u32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            color: Rgb([0x00, 0xFF, 0xFF]),
            line_width: 2,
            font_px: 18,
        }
    }
}

/// 2D drawing target in frame pixel coordinates.
///
/// Operations fail when the surface has gone away (e.g. its view was torn
/// down); the renderer abandons the pass on the first failure.
pub trait Surface {
    fn is_attached(&self) -> bool;

    fn dimensions(&self) -> FrameDimensions;

    fn resize(&mut self, width: u32, height: u32) -> Result<()>;

    fn clear(&mut self) -> Result<()>;

    fn draw_image(&mut self, frame: &Frame) -> Result<()>;

    fn stroke_rect(&mut self, rect: BoundingBox, style: &OverlayStyle) -> Result<()>;

    /// `y` is the text baseline, as with a canvas `fillText`.
    fn fill_text(&mut self, text: &str, x: f32, y: f32, style: &OverlayStyle) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderOutcome {
    Drawn { boxes: usize },
    /// The surface was unavailable; nothing further should be scheduled.
    Aborted,
}

/// `"{label} ({percent}%)"`.
pub fn label_text(detection: &Detection) -> String {
    format!("{} ({}%)", detection.class_label, detection.percent())
}

/// Label anchor for a box: its left edge, lifted above the top when there
/// is room, otherwise pinned to the minimum baseline so it stays visible.
pub fn label_origin(bbox: &BoundingBox) -> (f32, f32) {
    let y = if bbox.y > LABEL_MIN_BASELINE {
        bbox.y - LABEL_LIFT
    } else {
        LABEL_MIN_BASELINE
    };
    (bbox.x, y)
}

#[derive(Clone, Debug, Default)]
pub struct OverlayRenderer {
    style: OverlayStyle,
}

impl OverlayRenderer {
    pub fn new(style: OverlayStyle) -> Self {
        Self { style }
    }

    /// Paint `frame` and `detections` onto `surface`. Only the surface is
    /// mutated.
    pub fn render<S: Surface + ?Sized>(
        &self,
        frame: &Frame,
        detections: &[Detection],
        surface: &mut S,
    ) -> RenderOutcome {
        if !surface.is_attached() {
            return RenderOutcome::Aborted;
        }
        match self.paint(frame, detections, surface) {
            Ok(()) => RenderOutcome::Drawn {
                boxes: detections.len(),
            },
            Err(err) => {
                log::debug!("render pass for frame {} abandoned: {:#}", frame.sequence, err);
                RenderOutcome::Aborted
            }
        }
    }

    fn paint<S: Surface + ?Sized>(
        &self,
        frame: &Frame,
        detections: &[Detection],
        surface: &mut S,
    ) -> Result<()> {
        surface.resize(frame.width, frame.height)?;
        surface.clear()?;
        surface.draw_image(frame)?;
        for detection in detections {
            surface.stroke_rect(detection.bbox, &self.style)?;
            let (x, y) = label_origin(&detection.bbox);
            surface.fill_text(&label_text(detection), x, y, &self.style)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![30u8; (width * height * 3) as usize], width, height, 1).expect("frame")
    }

    #[test]
    fn label_is_lifted_when_there_is_room() {
        assert_eq!(label_origin(&BoundingBox::new(7.0, 40.0, 5.0, 5.0)), (7.0, 35.0));
        assert_eq!(label_origin(&BoundingBox::new(7.0, 10.5, 5.0, 5.0)), (7.0, 5.5));
    }

    #[test]
    fn label_is_pinned_near_top_edge() {
        for y in [-4.0, 0.0, 5.0, 10.0] {
            assert_eq!(label_origin(&BoundingBox::new(3.0, y, 5.0, 5.0)).1, 10.0);
        }
    }

    #[test]
    fn label_text_uses_rounded_percent() {
        let detection = Detection::new("cup", 0.9, BoundingBox::default());
        assert_eq!(label_text(&detection), "cup (90%)");
        let detection = Detection::new("cell phone", 0.456, BoundingBox::default());
        assert_eq!(label_text(&detection), "cell phone (46%)");
    }

    #[test]
    fn cup_near_top_is_boxed_and_label_clamped() {
        let renderer = OverlayRenderer::default();
        let mut surface = RecordingSurface::new();
        let cup = Detection::new("cup", 0.9, BoundingBox::new(5.0, 5.0, 20.0, 20.0));

        let outcome = renderer.render(&frame(100, 100), &[cup], &mut surface);

        assert_eq!(outcome, RenderOutcome::Drawn { boxes: 1 });
        assert_eq!(
            surface.ops(),
            &[
                DrawOp::Resize {
                    width: 100,
                    height: 100
                },
                DrawOp::Clear,
                DrawOp::Image { sequence: 1 },
                DrawOp::StrokeRect(BoundingBox::new(5.0, 5.0, 20.0, 20.0)),
                DrawOp::FillText {
                    text: "cup (90%)".to_string(),
                    x: 5.0,
                    y: 10.0
                },
            ]
        );
    }

    #[test]
    fn empty_list_draws_background_only() {
        let renderer = OverlayRenderer::default();
        let mut surface = RecordingSurface::new();
        let outcome = renderer.render(&frame(8, 6), &[], &mut surface);
        assert_eq!(outcome, RenderOutcome::Drawn { boxes: 0 });
        assert_eq!(
            surface.ops(),
            &[
                DrawOp::Resize {
                    width: 8,
                    height: 6
                },
                DrawOp::Clear,
                DrawOp::Image { sequence: 1 },
            ]
        );
    }

    #[test]
    fn detached_surface_aborts_without_drawing() {
        let renderer = OverlayRenderer::default();
        let mut surface = RecordingSurface::new();
        surface.detach();
        assert_eq!(
            renderer.render(&frame(4, 4), &[], &mut surface),
            RenderOutcome::Aborted
        );
        assert!(surface.ops().is_empty());
    }

    #[test]
    fn surface_tracks_source_dimension_changes() {
        let renderer = OverlayRenderer::default();
        let mut surface = ImageSurface::new();
        renderer.render(&frame(16, 8), &[], &mut surface);
        assert_eq!(surface.dimensions(), FrameDimensions::new(16, 8));
        renderer.render(&frame(10, 12), &[], &mut surface);
        assert_eq!(surface.dimensions(), FrameDimensions::new(10, 12));
    }

    #[test]
    fn detections_are_drawn_in_list_order() {
        let renderer = OverlayRenderer::default();
        let mut surface = RecordingSurface::new();
        let a = Detection::new("person", 0.7, BoundingBox::new(1.0, 30.0, 4.0, 4.0));
        let b = Detection::new("dog", 0.6, BoundingBox::new(9.0, 2.0, 4.0, 4.0));
        renderer.render(&frame(50, 50), &[a, b], &mut surface);

        let labels: Vec<&str> = surface
            .ops()
            .iter()
            .filter_map(|op| match op {
                DrawOp::FillText { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec!["person (70%)", "dog (60%)"]);
    }
}
