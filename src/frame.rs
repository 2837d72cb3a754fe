//! Decoded video frames.
//!
//! A `Frame` is the unit that flows through one loop iteration: the capture
//! stream produces it, the detector reads it, the overlay renderer paints it
//! as the background, and then it is dropped.
//!
//! Streams that have started playing may still hand out frames before the
//! decoder knows the picture size. Those frames report `0x0` and carry no
//! pixels; callers must check `has_dimensions()` before using them.

use anyhow::{anyhow, Result};
use image::{ImageBuffer, Rgb};

/// Borrowed RGB8 view over a frame's pixels.
pub type FrameView<'a> = ImageBuffer<Rgb<u8>, &'a [u8]>;

/// Width/height pair reported by a frame or stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameDimensions {
    pub width: u32,
    pub height: u32,
}

impl FrameDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both sides are non-zero.
    pub fn is_usable(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// A single decoded RGB8 frame.
///
/// Frames are ephemeral: there is no `Clone`. Pixels are read-only once the
/// frame is built.
pub struct Frame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Monotonic sequence number assigned by the stream.
    pub sequence: u64,
}

impl Frame {
    /// Build a frame from packed RGB8 pixels.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch for {}x{}: expected {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
        })
    }

    /// A frame from a stream whose dimensions are not known yet.
    pub fn pending(sequence: u64) -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            sequence,
        }
    }

    pub fn dimensions(&self) -> FrameDimensions {
        FrameDimensions::new(self.width, self.height)
    }

    pub fn has_dimensions(&self) -> bool {
        self.dimensions().is_usable()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Image view for drawing and resampling. `None` for pending frames.
    pub fn view(&self) -> Option<FrameView<'_>> {
        if !self.has_dimensions() {
            return None;
        }
        ImageBuffer::from_raw(self.width, self.height, self.data.as_slice())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_wrong_length() {
        assert!(Frame::new(vec![0u8; 10], 2, 2, 1).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2, 1).is_ok());
    }

    #[test]
    fn pending_frame_has_no_dimensions() {
        let frame = Frame::pending(7);
        assert!(!frame.has_dimensions());
        assert_eq!(frame.dimensions(), FrameDimensions::default());
        assert!(frame.view().is_none());
        assert!(frame.pixels().is_empty());
    }

    #[test]
    fn view_exposes_pixels() -> Result<()> {
        let mut data = vec![0u8; 2 * 2 * 3];
        data[3] = 200;
        let frame = Frame::new(data, 2, 2, 3)?;
        let view = frame.view().expect("view");
        assert_eq!(view.get_pixel(1, 0)[0], 200);
        assert_eq!(view.get_pixel(0, 0)[0], 0);
        Ok(())
    }

    #[test]
    fn one_sided_dimensions_are_not_usable() {
        assert!(!FrameDimensions::new(640, 0).is_usable());
        assert!(!FrameDimensions::new(0, 480).is_usable());
        assert!(FrameDimensions::new(1, 1).is_usable());
    }
}
