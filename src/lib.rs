//! Live object detection over a camera feed.
//!
//! Each refresh tick the loop reads the camera's current frame, runs the
//! detector on it, repaints the overlay (frame plus one labelled box per
//! detection) and evaluates a one-shot alert. Exactly one cycle runs at a
//! time.
//!
//! # Module Structure
//!
//! - `capture`: camera devices and streams (synthetic, V4L2)
//! - `frame`: decoded RGB frames
//! - `detect`: the `Detector` capability and its backends
//! - `overlay`: box/label rendering onto a `Surface`
//! - `alert`: the one-shot alert latch
//! - `scheduler`: the frame loop state machine and tick sources
//! - `session`: setup, run and teardown of one detection session
//! - `config`: file + env configuration
//! - `ui`: terminal stage reporting

pub mod alert;
pub mod capture;
pub mod config;
pub mod detect;
pub mod frame;
pub mod overlay;
pub mod scheduler;
pub mod session;
pub mod ui;

pub use alert::{evaluate, AlertPolicy, AlertSink, AlertState, AlertTrigger, LogAlertSink};
pub use capture::{open_device, CaptureDevice, SourceConfig, StreamGuard, VideoStream};
pub use config::LiveDetectConfig;
pub use detect::{model_loader, BoundingBox, Detection, DetectionList, Detector, ModelLoader};
pub use frame::{Frame, FrameDimensions};
pub use overlay::{ImageSurface, OverlayRenderer, OverlayStyle, RecordingSurface, Surface};
pub use scheduler::{CancelToken, FrameScheduler, RefreshClock, StopReason, TickScheduler};
pub use session::{
    ActiveSession, DetectionSession, SessionController, SessionError, SessionFailure,
    SessionSettings, SessionSummary,
};
