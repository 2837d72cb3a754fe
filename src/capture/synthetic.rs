//! Synthetic capture sources.
//!
//! `SyntheticCamera` renders a dim moving gradient with a bright rectangular
//! "object" that sweeps across the picture and periodically leaves the scene.
//! The stub detector backend looks for exactly that object, so a stub camera
//! paired with the stub backend gives a complete, deterministic loop without
//! hardware.
//!
//! After readiness the stream reports `0x0` for `warmup_frames` frames. Real
//! cameras do this too: playback can begin before decoded dimensions exist.

use anyhow::{anyhow, Result};
use rand::Rng;
use std::time::Duration;

use super::{
    CaptureDevice, SourceConfig, StreamMetadata, StreamStats, VideoStream, MAX_SOURCE_SIDE,
};
use crate::frame::{rgb_len, Frame, FrameDimensions};

/// Pixel value of the synthetic object. The background never exceeds 100.
pub const OBJECT_LUMA: u8 = 250;

const SCENE_PERIOD: u64 = 120;
const OBJECT_ABSENT_FRAMES: u64 = 30;

/// Synthetic camera for `stub://` sources.
pub struct SyntheticCamera {
    config: SourceConfig,
}

impl SyntheticCamera {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

impl CaptureDevice for SyntheticCamera {
    fn name(&self) -> &str {
        &self.config.uri
    }

    fn acquire(&mut self) -> Result<Box<dyn VideoStream>> {
        let (width, height) = (self.config.width, self.config.height);
        if width == 0 || height == 0 {
            return Err(anyhow!(
                "synthetic camera {} has no picture size configured",
                self.config.uri
            ));
        }
        if width > MAX_SOURCE_SIDE || height > MAX_SOURCE_SIDE {
            return Err(anyhow!(
                "synthetic camera {} size {}x{} exceeds {} per side",
                self.config.uri,
                width,
                height,
                MAX_SOURCE_SIDE
            ));
        }
        log::info!("SyntheticCamera: acquired {}", self.config.uri);
        Ok(Box::new(SyntheticStream::new(self.config.clone())))
    }
}

struct SyntheticStream {
    config: SourceConfig,
    ready: bool,
    released: bool,
    frames_served: u64,
    frames_captured: u64,
    object_offset: u32,
}

impl SyntheticStream {
    fn new(config: SourceConfig) -> Self {
        let object_offset = rand::thread_rng().gen_range(0..config.width.max(1));
        Self {
            config,
            ready: false,
            released: false,
            frames_served: 0,
            frames_captured: 0,
            object_offset,
        }
    }

    fn object_rect(&self) -> Option<(u32, u32, u32, u32)> {
        if self.frames_captured % SCENE_PERIOD >= SCENE_PERIOD - OBJECT_ABSENT_FRAMES {
            return None;
        }
        let width = self.config.width;
        let height = self.config.height;
        let obj_w = (width / 6).max(1);
        let obj_h = (height / 4).max(1);
        let travel = width.saturating_sub(obj_w).max(1);
        let step = (self.frames_captured as u32).wrapping_mul(4);
        let x = self.object_offset.wrapping_add(step) % travel;
        let y = (height / 2).saturating_sub(obj_h / 2);
        Some((x, y, obj_w, obj_h))
    }

    fn render_pixels(&self) -> Result<Vec<u8>> {
        let width = self.config.width;
        let height = self.config.height;
        let mut pixels = vec![0u8; rgb_len(width, height)?];
        let row_len = width as usize * 3;
        let object = self.object_rect();
        let shift = self.frames_captured;

        for y in 0..height {
            for x in 0..width {
                let offset = y as usize * row_len + x as usize * 3;
                let inside = object.is_some_and(|(ox, oy, ow, oh)| {
                    x >= ox && x < ox + ow && y >= oy && y < oy + oh
                });
                if inside {
                    pixels[offset..offset + 3].fill(OBJECT_LUMA);
                } else {
                    let base = ((x as u64 + y as u64 + shift) % 64) as u8 + 20;
                    pixels[offset] = base;
                    pixels[offset + 1] = base / 2 + 10;
                    pixels[offset + 2] = 90;
                }
            }
        }
        Ok(pixels)
    }
}

impl VideoStream for SyntheticStream {
    fn wait_ready(&mut self, _timeout: Duration) -> Result<StreamMetadata> {
        if self.released {
            return Err(anyhow!("synthetic stream {} was released", self.config.uri));
        }
        self.ready = true;
        Ok(StreamMetadata {
            source: self.config.uri.clone(),
            dimensions: FrameDimensions::new(self.config.width, self.config.height),
        })
    }

    fn current_frame(&mut self) -> Result<Frame> {
        if self.released {
            return Err(anyhow!("synthetic stream {} was released", self.config.uri));
        }
        self.frames_served += 1;
        if !self.ready || self.frames_served <= self.config.warmup_frames as u64 {
            return Ok(Frame::pending(self.frames_served));
        }

        self.frames_captured += 1;
        let pixels = self.render_pixels()?;
        Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            self.frames_served,
        )
    }

    fn release(&mut self) {
        self.released = true;
        self.ready = false;
    }

    fn is_healthy(&self) -> bool {
        !self.released
    }

    fn stats(&self) -> StreamStats {
        StreamStats {
            frames_captured: self.frames_captured,
            source: self.config.uri.clone(),
        }
    }
}

/// Camera that refuses acquisition, e.g. `fail://permission denied`.
pub struct FailingCamera {
    uri: String,
    reason: String,
}

impl FailingCamera {
    pub fn new(reason: &str) -> Self {
        let reason = if reason.trim().is_empty() {
            "no capture device".to_string()
        } else {
            reason.to_string()
        };
        Self {
            uri: format!("fail://{}", reason),
            reason,
        }
    }
}

impl CaptureDevice for FailingCamera {
    fn name(&self) -> &str {
        &self.uri
    }

    fn acquire(&mut self) -> Result<Box<dyn VideoStream>> {
        Err(anyhow!("camera unavailable: {}", self.reason))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
