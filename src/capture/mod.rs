//! Video capture sources.
//!
//! A `CaptureDevice` hands out a `VideoStream` when acquired. The stream is
//! not usable right away. Callers must wait for `wait_ready` before they
//! trust any dimensions it reports, and even after readiness a stream may
//! produce a few `0x0` frames while the decoder settles.
//!
//! Available sources:
//! - `stub://<name>` synthetic camera (always available)
//! - `fail://<reason>` camera that refuses acquisition (testing)
//! - `/dev/videoN` V4L2 webcams (feature: capture-v4l2)
//!
//! Streams MUST be released when the session ends. `StreamGuard` does this
//! on drop so that error paths cannot leak the device.

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::frame::{Frame, FrameDimensions};

#[cfg(feature = "capture-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

pub use synthetic::{FailingCamera, SyntheticCamera};
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Camera;

/// Largest accepted frame side in pixels.
pub const MAX_SOURCE_SIDE: u32 = 8192;

/// Configuration for the capture source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Source URI (`stub://front`, `fail://denied`, `/dev/video0`).
    pub uri: String,
    /// Requested frame width. Devices may negotiate a different size.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Requested capture rate.
    pub target_fps: u32,
    /// Synthetic only: frames reported as `0x0` after readiness.
    pub warmup_frames: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: "stub://camera".to_string(),
            width: 640,
            height: 480,
            target_fps: 30,
            warmup_frames: 3,
        }
    }
}

/// Metadata available once a stream becomes playable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMetadata {
    pub source: String,
    pub dimensions: FrameDimensions,
}

/// Statistics for a capture stream.
#[derive(Clone, Debug)]
pub struct StreamStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Something that can hand out a live video stream.
pub trait CaptureDevice {
    /// Device identifier for logs.
    fn name(&self) -> &str;

    /// Acquire the device. Fails on missing devices or denied permission.
    fn acquire(&mut self) -> Result<Box<dyn VideoStream>>;
}

/// An acquired, playing video stream.
pub trait VideoStream {
    /// Block until the stream has playable metadata, or fail after `timeout`.
    fn wait_ready(&mut self, timeout: Duration) -> Result<StreamMetadata>;

    /// The frame currently being shown. May be `0x0` while dimensions settle.
    fn current_frame(&mut self) -> Result<Frame>;

    /// Stop capture and give the device back. Idempotent.
    fn release(&mut self);

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> StreamStats;
}

/// Owns a stream and releases it on drop.
pub struct StreamGuard {
    stream: Box<dyn VideoStream>,
}

impl StreamGuard {
    pub fn new(stream: Box<dyn VideoStream>) -> Self {
        Self { stream }
    }

    pub fn stream(&mut self) -> &mut dyn VideoStream {
        self.stream.as_mut()
    }

    pub fn stats(&self) -> StreamStats {
        self.stream.stats()
    }

    pub fn is_healthy(&self) -> bool {
        self.stream.is_healthy()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let stats = self.stream.stats();
        self.stream.release();
        log::info!(
            "capture released: {} ({} frames)",
            stats.source,
            stats.frames_captured
        );
    }
}

/// Open the capture device named by `config.uri`.
pub fn open_device(config: &SourceConfig) -> Result<Box<dyn CaptureDevice>> {
    let uri = config.uri.trim();
    if uri.is_empty() {
        return Err(anyhow!("capture source must not be empty"));
    }
    if uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticCamera::new(config.clone())));
    }
    if let Some(reason) = uri.strip_prefix("fail://") {
        return Ok(Box::new(FailingCamera::new(reason)));
    }
    if uri.contains("://") {
        return Err(anyhow!(
            "unsupported capture source '{}' (expected stub://, fail:// or a device path)",
            uri
        ));
    }

    #[cfg(feature = "capture-v4l2")]
    {
        Ok(Box::new(V4l2Camera::new(config.clone())))
    }
    #[cfg(not(feature = "capture-v4l2"))]
    {
        Err(anyhow!(
            "capture device {} requires the capture-v4l2 feature",
            uri
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_device_selects_by_scheme() -> Result<()> {
        let stub = open_device(&SourceConfig::default())?;
        assert_eq!(stub.name(), "stub://camera");

        let failing = open_device(&SourceConfig {
            uri: "fail://permission denied".to_string(),
            ..SourceConfig::default()
        })?;
        assert_eq!(failing.name(), "fail://permission denied");
        Ok(())
    }

    #[test]
    fn open_device_rejects_network_schemes() {
        let result = open_device(&SourceConfig {
            uri: "rtsp://camera".to_string(),
            ..SourceConfig::default()
        });
        assert!(result.is_err());
        assert!(open_device(&SourceConfig {
            uri: "  ".to_string(),
            ..SourceConfig::default()
        })
        .is_err());
    }
}
