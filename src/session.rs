//! Session lifecycle: acquire the camera and load the model, wait for the
//! stream to become playable, run the frame loop, and release everything
//! on the way out.
//!
//! The camera stream is owned by a `StreamGuard` from the moment it is
//! acquired, so every exit path (model load failure, readiness timeout,
//! cancel, normal teardown) gives the device back.
//!
//! The model loads on its own thread. Acquisition failure and cancel do not
//! wait for it; an abandoned loader finishes in the background and its
//! result is dropped.

use anyhow::{anyhow, Context};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::alert::{AlertPolicy, AlertSink, AlertState, AlertTrigger};
use crate::capture::{CaptureDevice, StreamGuard, StreamMetadata};
use crate::detect::{Detection, DetectionList, Detector, ModelLoader};
use crate::frame::Frame;
use crate::overlay::{OverlayRenderer, OverlayStyle, RenderOutcome, Surface};
use crate::scheduler::{
    CancelToken, CycleReport, FrameScheduler, LoopStats, StepOutcome, StopReason, TickScheduler,
};
use crate::ui::{StageGuard, Ui};

/// Why a session could not start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionFailure {
    /// Camera missing or permission denied.
    Acquisition,
    /// Stream acquired but never became playable.
    NotReady,
    ModelLoad,
    Cancelled,
}

impl SessionFailure {
    pub fn code(&self) -> &'static str {
        match self {
            SessionFailure::Acquisition => "CAMERA_UNAVAILABLE",
            SessionFailure::NotReady => "CAMERA_NOT_READY",
            SessionFailure::ModelLoad => "MODEL_LOAD_FAILED",
            SessionFailure::Cancelled => "SESSION_CANCELLED",
        }
    }
}

#[derive(Debug)]
pub struct SessionError {
    pub kind: SessionFailure,
    pub message: String,
}

impl SessionError {
    fn new(kind: SessionFailure, err: anyhow::Error) -> Self {
        Self {
            kind,
            message: format!("{:#}", err),
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}
impl std::error::Error for SessionError {}

/// The per-session pieces a loop cycle works on.
pub struct DetectionSession<S: Surface> {
    detector: Box<dyn Detector>,
    renderer: OverlayRenderer,
    alert: AlertPolicy,
    sink: Box<dyn AlertSink>,
    surface: S,
}

impl<S: Surface> DetectionSession<S> {
    pub fn new(
        detector: Box<dyn Detector>,
        renderer: OverlayRenderer,
        alert: AlertPolicy,
        sink: Box<dyn AlertSink>,
        surface: S,
    ) -> Self {
        Self {
            detector,
            renderer,
            alert,
            sink,
            surface,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn alert_state(&self) -> AlertState {
        self.alert.state()
    }

    pub(crate) fn detect(&mut self, frame: &Frame) -> anyhow::Result<DetectionList> {
        self.detector.detect(frame)
    }

    pub(crate) fn present(&mut self, frame: &Frame, detections: &[Detection]) -> RenderOutcome {
        self.renderer.render(frame, detections, &mut self.surface)
    }

    /// Advance the alert latch and raise the sink if it fired. Returns the
    /// class label that fired.
    pub(crate) fn evaluate_alert(&mut self, detections: &[Detection]) -> Option<String> {
        let hit = self.alert.check(detections)?;
        self.sink.raise(hit);
        Some(hit.class_label.clone())
    }
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// How long to wait for the stream to report playable metadata.
    pub ready_timeout: Duration,
    pub trigger: Option<AlertTrigger>,
    pub style: OverlayStyle,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            trigger: None,
            style: OverlayStyle::default(),
        }
    }
}

const LOADER_POLL: Duration = Duration::from_millis(10);

/// Brings sessions up.
pub struct SessionController {
    settings: SessionSettings,
    cancel: CancelToken,
    ui: Option<Ui>,
}

impl SessionController {
    pub fn new(settings: SessionSettings, cancel: CancelToken) -> Self {
        Self {
            settings,
            cancel,
            ui: None,
        }
    }

    /// Report setup stages through `ui`.
    pub fn with_ui(mut self, ui: Ui) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Acquire `device` while the model loads on a background thread, then
    /// wait for the stream to become playable.
    ///
    /// On any failure the stream, if it was acquired, is released before
    /// this returns. Acquisition failure and cancel return without waiting
    /// for the model.
    pub fn start<S: Surface>(
        &self,
        device: &mut dyn CaptureDevice,
        loader: Arc<dyn ModelLoader>,
        surface: S,
        sink: Box<dyn AlertSink>,
    ) -> Result<ActiveSession<S>, SessionError> {
        let device_name = device.name().to_string();
        let stage = self.stage("acquire camera and load model");
        let loading = std::thread::Builder::new()
            .name("model-loader".to_string())
            .spawn(move || {
                loader
                    .load()
                    .with_context(|| format!("load {} model", loader.name()))
            })
            .context("spawn model loader thread");
        let loading = match loading {
            Ok(loading) => loading,
            Err(err) => {
                let err = SessionError::new(SessionFailure::ModelLoad, err);
                fail_stage(stage, &err);
                return Err(err);
            }
        };

        let stream = match device
            .acquire()
            .with_context(|| format!("acquire {}", device_name))
        {
            Ok(stream) => stream,
            Err(err) => {
                log::debug!("abandoning model load after acquisition failure");
                let err = SessionError::new(SessionFailure::Acquisition, err);
                fail_stage(stage, &err);
                return Err(err);
            }
        };
        let mut guard = StreamGuard::new(stream);

        let mut detector = match self.join_loader(loading) {
            Ok(detector) => detector,
            Err(err) => {
                fail_stage(stage, &err);
                return Err(err);
            }
        };
        if let Err(err) = detector.warm_up().context("model warm-up") {
            let err = SessionError::new(SessionFailure::ModelLoad, err);
            fail_stage(stage, &err);
            return Err(err);
        }
        drop(stage);

        if self.cancel.is_cancelled() {
            return Err(SessionError::new(
                SessionFailure::Cancelled,
                anyhow!("cancelled before the stream was ready"),
            ));
        }

        let stage = self.stage("wait for camera stream");
        let metadata = match guard
            .stream()
            .wait_ready(self.settings.ready_timeout)
            .with_context(|| format!("{} never became playable", device_name))
        {
            Ok(metadata) => metadata,
            Err(err) => {
                let err = SessionError::new(SessionFailure::NotReady, err);
                fail_stage(stage, &err);
                return Err(err);
            }
        };
        drop(stage);

        log::info!(
            "session started: source={} reported={}x{} detector={} alert={}",
            metadata.source,
            metadata.dimensions.width,
            metadata.dimensions.height,
            detector.name(),
            self.settings
                .trigger
                .as_ref()
                .map(|t| format!("{}>={:.2}", t.class_label, t.min_confidence))
                .unwrap_or_else(|| "off".to_string())
        );

        let session = DetectionSession::new(
            detector,
            OverlayRenderer::new(self.settings.style),
            AlertPolicy::new(self.settings.trigger.clone()),
            sink,
            surface,
        );
        Ok(ActiveSession {
            stream: guard,
            session,
            scheduler: FrameScheduler::new(self.cancel.clone()),
            metadata,
            stop_reason: None,
        })
    }

    /// Wait for the loader thread, giving up as soon as the session is
    /// cancelled.
    fn join_loader(
        &self,
        loading: JoinHandle<anyhow::Result<Box<dyn Detector>>>,
    ) -> Result<Box<dyn Detector>, SessionError> {
        loop {
            if self.cancel.is_cancelled() {
                log::debug!("abandoning model load after cancel");
                return Err(SessionError::new(
                    SessionFailure::Cancelled,
                    anyhow!("cancelled while the model was loading"),
                ));
            }
            if loading.is_finished() {
                break;
            }
            std::thread::sleep(LOADER_POLL);
        }
        loading
            .join()
            .unwrap_or_else(|_| Err(anyhow!("model loader thread panicked")))
            .map_err(|err| SessionError::new(SessionFailure::ModelLoad, err))
    }

    fn stage(&self, name: &str) -> Option<StageGuard> {
        self.ui.as_ref().map(|ui| ui.stage(name))
    }
}

fn fail_stage(stage: Option<StageGuard>, err: &SessionError) {
    if let Some(stage) = stage {
        stage.fail(err);
    }
}

/// Totals reported when a session is torn down.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub stop_reason: Option<StopReason>,
    pub stats: LoopStats,
    pub frames_captured: u64,
    pub alert_fired: bool,
}

/// A running session. Dropping it releases the camera.
pub struct ActiveSession<S: Surface> {
    stream: StreamGuard,
    session: DetectionSession<S>,
    scheduler: FrameScheduler,
    metadata: StreamMetadata,
    stop_reason: Option<StopReason>,
}

impl<S: Surface> ActiveSession<S> {
    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    pub fn session(&self) -> &DetectionSession<S> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut DetectionSession<S> {
        &mut self.session
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    pub fn is_healthy(&self) -> bool {
        self.stream.is_healthy()
    }

    /// Run one cycle without waiting for a tick.
    pub fn step(&mut self) -> StepOutcome {
        let outcome = self.scheduler.step(self.stream.stream(), &mut self.session);
        if let StepOutcome::Stopped(reason) = &outcome {
            self.stop_reason = Some(*reason);
        }
        outcome
    }

    /// Drive the loop from `ticks` until it stops. `observer` sees every
    /// completed cycle.
    pub fn run<T, F>(&mut self, ticks: &mut T, observer: F) -> StopReason
    where
        T: TickScheduler + ?Sized,
        F: FnMut(&CycleReport, &LoopStats, &DetectionSession<S>),
    {
        let reason = self
            .scheduler
            .run(self.stream.stream(), &mut self.session, ticks, observer);
        log::info!("frame loop stopped: {}", reason);
        self.stop_reason = Some(reason);
        reason
    }

    /// Stop scheduling and release the camera.
    pub fn teardown(self) -> SessionSummary {
        self.scheduler.cancel_token().cancel();
        let summary = SessionSummary {
            stop_reason: self.stop_reason,
            stats: self.scheduler.stats().clone(),
            frames_captured: self.stream.stats().frames_captured,
            alert_fired: self.session.alert_state().fired(),
        };
        drop(self);
        summary
    }
}
