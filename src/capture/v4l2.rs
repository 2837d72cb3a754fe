//! V4L2 webcam source.
//!
//! Opens a local device node (e.g. `/dev/video0`), negotiates RGB3 or YUYV
//! and memory-maps a small buffer ring. The negotiated size becomes the
//! stream metadata; requested sizes are only a preference.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{CaptureDevice, SourceConfig, StreamMetadata, StreamStats, VideoStream};
use crate::frame::{Frame, FrameDimensions};

/// V4L2 capture device.
pub struct V4l2Camera {
    config: SourceConfig,
}

impl V4l2Camera {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

impl CaptureDevice for V4l2Camera {
    fn name(&self) -> &str {
        &self.config.uri
    }

    fn acquire(&mut self) -> Result<Box<dyn VideoStream>> {
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.uri)
            .with_context(|| format!("open v4l2 device {}", self.config.uri))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Camera: failed to set RGB3 on {}: {}",
                    self.config.uri,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr)?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Camera: failed to set fps on {}: {}",
                    self.config.uri,
                    err
                );
            }
        }

        log::info!(
            "V4l2Camera: acquired {} ({}x{} {:?})",
            self.config.uri,
            format.width,
            format.height,
            pixel_format
        );

        Ok(Box::new(V4l2Stream {
            source: self.config.uri.clone(),
            state: Some(open_stream(device)?),
            dimensions: FrameDimensions::new(format.width, format.height),
            pixel_format,
            ready: false,
            frames_captured: 0,
            last_frame_at: None,
            last_error: None,
            target_fps: self.config.target_fps,
        }))
    }
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

fn open_stream(device: v4l::Device) -> Result<V4l2State> {
    V4l2StateBuilder {
        device,
        stream_builder: |device| {
            v4l::prelude::MmapStream::with_buffers(device, v4l::buffer::Type::VideoCapture, 4)
                .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
        },
    }
    .try_build()
}

struct V4l2Stream {
    source: String,
    state: Option<V4l2State>,
    dimensions: FrameDimensions,
    pixel_format: PixelFormat,
    ready: bool,
    frames_captured: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    target_fps: u32,
}

impl V4l2Stream {
    fn capture(&mut self) -> Result<Vec<u8>> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("v4l2 stream {} was released", self.source))?;
        let (width, height, format) = (
            self.dimensions.width,
            self.dimensions.height,
            self.pixel_format,
        );
        let result = state.with_mut(|fields| {
            let (buf, _meta) = fields.stream.next()?;
            Ok::<_, std::io::Error>(normalize_to_rgb(buf, width, height, format))
        });
        match result {
            Ok(pixels) => pixels,
            Err(err) => {
                self.last_error = Some(err.to_string());
                Err(anyhow::Error::new(err).context("capture v4l2 frame"))
            }
        }
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.target_fps == 0 {
            2_000
        } else {
            (1000 / self.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

impl VideoStream for V4l2Stream {
    fn wait_ready(&mut self, timeout: Duration) -> Result<StreamMetadata> {
        let started = Instant::now();
        if let Some(state) = self.state.as_mut() {
            state.with_stream_mut(|stream| stream.set_timeout(timeout));
        }
        // The first dequeued buffer proves the device is streaming.
        self.capture()
            .with_context(|| format!("{} produced no frame within {:?}", self.source, timeout))?;
        self.ready = true;
        log::debug!(
            "V4l2Camera: {} ready after {:?}",
            self.source,
            started.elapsed()
        );
        Ok(StreamMetadata {
            source: self.source.clone(),
            dimensions: self.dimensions,
        })
    }

    fn current_frame(&mut self) -> Result<Frame> {
        if !self.ready {
            return Ok(Frame::pending(self.frames_captured));
        }
        let pixels = self.capture()?;
        self.frames_captured += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::new(
            pixels,
            self.dimensions.width,
            self.dimensions.height,
            self.frames_captured,
        )
    }

    fn release(&mut self) {
        self.ready = false;
        // Dropping the mmap stream issues STREAMOFF and closes the device.
        self.state = None;
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.state.is_none() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> StreamStats {
        StreamStats {
            frames_captured: self.frames_captured,
            source: self.source.clone(),
        }
    }
}
