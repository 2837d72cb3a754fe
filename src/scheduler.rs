//! Frame scheduling loop.
//!
//! One cycle is: read the stream's current frame, detect, render, evaluate
//! the alert, then ask the tick source for exactly one more tick. Cycles
//! never overlap because the next tick is only requested after the current
//! cycle has finished.
//!
//! ```text
//! WaitingForDimensions --(frame has size)--> Detecting
//! WaitingForDimensions --(0x0 frame)-------> WaitingForDimensions (next tick)
//! Detecting --(result or failure)----------> IdleReschedule
//! IdleReschedule --(render + alert)--------> WaitingForDimensions (next tick)
//! any state --(cancel)---------------------> stopped
//! WaitingForDimensions --(source lost)-----> stopped
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::VideoStream;
use crate::detect::DetectionList;
use crate::overlay::{RenderOutcome, Surface};
use crate::session::DetectionSession;

/// Shared stop flag for a session.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// "Run me once on the next display refresh."
pub trait TickScheduler {
    /// Block until the next tick. Returns false when no further tick will
    /// come (cancelled, or the source ran dry).
    fn next_tick(&mut self, cancel: &CancelToken) -> bool;
}

/// Paces ticks to a fixed refresh rate, aligned to period boundaries.
///
/// A cycle that overruns its period lands on the next boundary after it
/// finishes; missed ticks are not queued up.
#[derive(Debug)]
pub struct RefreshClock {
    period: Duration,
    origin: Instant,
}

const CANCEL_POLL: Duration = Duration::from_millis(10);

impl RefreshClock {
    pub fn new(refresh_hz: u32) -> Self {
        let hz = refresh_hz.max(1);
        Self {
            period: Duration::from_nanos(1_000_000_000 / hz as u64),
            origin: Instant::now(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn next_boundary(&self, now: Instant) -> Instant {
        let period = self.period.as_nanos().max(1);
        let elapsed = now.duration_since(self.origin).as_nanos();
        let next = (elapsed / period + 1) * period;
        self.origin + Duration::from_nanos(next as u64)
    }
}

impl TickScheduler for RefreshClock {
    fn next_tick(&mut self, cancel: &CancelToken) -> bool {
        let target = self.next_boundary(Instant::now());
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= target {
                return true;
            }
            std::thread::sleep((target - now).min(CANCEL_POLL));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    WaitingForDimensions,
    Detecting,
    IdleReschedule,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    SurfaceDetached,
    /// The capture stream stopped producing frames.
    SourceLost,
    TicksExhausted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StopReason::Cancelled => "cancelled",
            StopReason::SurfaceDetached => "surface detached",
            StopReason::SourceLost => "capture source lost",
            StopReason::TicksExhausted => "tick source exhausted",
        };
        f.write_str(text)
    }
}

/// What one completed cycle did.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub sequence: u64,
    pub detections: DetectionList,
    /// Detection failed; `detections` is the empty fallback.
    pub detect_failed: bool,
    /// Class label of the detection that fired the alert this cycle.
    pub alert_fired: Option<String>,
    pub inference: Duration,
    pub render: RenderOutcome,
    pub stream_healthy: bool,
}

#[derive(Debug)]
pub enum StepOutcome {
    /// No usable frame yet; try again next tick.
    Waiting,
    Cycle(CycleReport),
    Stopped(StopReason),
}

#[derive(Clone, Debug, Default)]
pub struct LoopStats {
    pub cycles: u64,
    pub waiting_ticks: u64,
    pub detections: u64,
    pub detect_failures: u64,
    pub frame_errors: u64,
    pub last_inference: Option<Duration>,
}

/// Consecutive failed frame reads after which the source counts as lost.
pub const MAX_CONSECUTIVE_FRAME_ERRORS: u32 = 30;

pub struct FrameScheduler {
    cancel: CancelToken,
    state: LoopState,
    stats: LoopStats,
    consecutive_frame_errors: u32,
}

impl FrameScheduler {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            state: LoopState::WaitingForDimensions,
            stats: LoopStats::default(),
            consecutive_frame_errors: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run a single cycle against the stream's current frame.
    pub fn step<S: Surface>(
        &mut self,
        stream: &mut dyn VideoStream,
        session: &mut DetectionSession<S>,
    ) -> StepOutcome {
        if self.cancel.is_cancelled() {
            return StepOutcome::Stopped(StopReason::Cancelled);
        }
        self.state = LoopState::WaitingForDimensions;

        let frame = match stream.current_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.frame_errors += 1;
                self.consecutive_frame_errors += 1;
                if !stream.is_healthy()
                    || self.consecutive_frame_errors >= MAX_CONSECUTIVE_FRAME_ERRORS
                {
                    log::error!(
                        "capture source lost after {} failed reads: {:#}",
                        self.consecutive_frame_errors,
                        err
                    );
                    return StepOutcome::Stopped(StopReason::SourceLost);
                }
                log::warn!("frame read failed: {:#}", err);
                return StepOutcome::Waiting;
            }
        };
        self.consecutive_frame_errors = 0;
        if !frame.has_dimensions() {
            self.stats.waiting_ticks += 1;
            log::trace!("frame {} has no dimensions yet", frame.sequence);
            return StepOutcome::Waiting;
        }

        self.state = LoopState::Detecting;
        let started = Instant::now();
        let (detections, detect_failed) = match session.detect(&frame) {
            Ok(detections) => (detections, false),
            Err(err) => {
                self.stats.detect_failures += 1;
                log::warn!("detection failed on frame {}: {:#}", frame.sequence, err);
                (DetectionList::new(), true)
            }
        };
        let inference = started.elapsed();
        self.stats.last_inference = Some(inference);
        self.state = LoopState::IdleReschedule;

        // Teardown may have happened while the detector was busy.
        if self.cancel.is_cancelled() {
            log::debug!(
                "discarding {} detections for frame {} after cancel",
                detections.len(),
                frame.sequence
            );
            return StepOutcome::Stopped(StopReason::Cancelled);
        }

        let render = session.present(&frame, &detections);
        if render == RenderOutcome::Aborted {
            log::info!("render surface gone, stopping loop");
            return StepOutcome::Stopped(StopReason::SurfaceDetached);
        }
        let alert_fired = session.evaluate_alert(&detections);

        self.stats.cycles += 1;
        self.stats.detections += detections.len() as u64;
        self.state = LoopState::WaitingForDimensions;

        StepOutcome::Cycle(CycleReport {
            sequence: frame.sequence,
            detections,
            detect_failed,
            alert_fired,
            inference,
            render,
            stream_healthy: stream.is_healthy(),
        })
    }

    /// Step, then wait for one tick, until cancelled, the surface goes away
    /// or the source is lost. `observer` sees each completed cycle with the
    /// running totals.
    pub fn run<S, T, F>(
        &mut self,
        stream: &mut dyn VideoStream,
        session: &mut DetectionSession<S>,
        ticks: &mut T,
        mut observer: F,
    ) -> StopReason
    where
        S: Surface,
        T: TickScheduler + ?Sized,
        F: FnMut(&CycleReport, &LoopStats, &DetectionSession<S>),
    {
        loop {
            match self.step(stream, session) {
                StepOutcome::Waiting => {}
                StepOutcome::Cycle(report) => observer(&report, &self.stats, session),
                StepOutcome::Stopped(reason) => return reason,
            }
            if !ticks.next_tick(&self.cancel) {
                return if self.cancel.is_cancelled() {
                    StopReason::Cancelled
                } else {
                    StopReason::TicksExhausted
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertPolicy, AlertSink, AlertTrigger};
    use crate::capture::{StreamMetadata, StreamStats};
    use crate::detect::{BoundingBox, Detection, Detector, StubBackend};
    use crate::frame::{Frame, FrameDimensions};
    use crate::overlay::{DrawOp, OverlayRenderer, RecordingSurface};
    use anyhow::{anyhow, Result};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Stream that plays back a fixed list of frame sizes.
    struct ScriptedStream {
        sizes: VecDeque<(u32, u32)>,
        sequence: u64,
    }

    impl ScriptedStream {
        fn new(sizes: &[(u32, u32)]) -> Self {
            Self {
                sizes: sizes.iter().copied().collect(),
                sequence: 0,
            }
        }
    }

    impl VideoStream for ScriptedStream {
        fn wait_ready(&mut self, _timeout: Duration) -> Result<StreamMetadata> {
            Ok(StreamMetadata {
                source: "scripted".to_string(),
                dimensions: FrameDimensions::new(8, 8),
            })
        }

        fn current_frame(&mut self) -> Result<Frame> {
            self.sequence += 1;
            let (w, h) = self.sizes.pop_front().unwrap_or((8, 8));
            if w == 0 || h == 0 {
                return Ok(Frame::pending(self.sequence));
            }
            Frame::new(vec![0u8; (w * h * 3) as usize], w, h, self.sequence)
        }

        fn release(&mut self) {}

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> StreamStats {
            StreamStats {
                frames_captured: self.sequence,
                source: "scripted".to_string(),
            }
        }
    }

    #[derive(Clone, Default)]
    struct EventLog(Arc<Mutex<Vec<String>>>);

    impl EventLog {
        fn push(&self, event: impl Into<String>) {
            self.0.lock().expect("log").push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.0.lock().expect("log").clone()
        }
    }

    /// Detector that records begin/end and can cancel the session mid-call.
    struct RecordingDetector {
        log: EventLog,
        result: Vec<Detection>,
        fail: bool,
        cancel_during: Option<CancelToken>,
    }

    impl Detector for RecordingDetector {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn detect(&mut self, frame: &Frame) -> Result<DetectionList> {
            self.log.push(format!("detect-begin {}", frame.sequence));
            if let Some(cancel) = &self.cancel_during {
                cancel.cancel();
            }
            self.log.push(format!("detect-end {}", frame.sequence));
            if self.fail {
                Err(anyhow!("inference backend error"))
            } else {
                Ok(self.result.clone())
            }
        }
    }

    #[derive(Clone, Default)]
    struct CountingSink(Arc<Mutex<Vec<String>>>);

    impl AlertSink for CountingSink {
        fn raise(&mut self, detection: &Detection) {
            self.0.lock().expect("sink").push(detection.class_label.clone());
        }
    }

    /// Tick source that grants a fixed number of ticks.
    struct CountedTicks {
        remaining: u32,
        log: Option<EventLog>,
    }

    impl TickScheduler for CountedTicks {
        fn next_tick(&mut self, cancel: &CancelToken) -> bool {
            if cancel.is_cancelled() || self.remaining == 0 {
                return false;
            }
            self.remaining -= 1;
            if let Some(log) = &self.log {
                log.push("tick");
            }
            true
        }
    }

    fn session(
        detector: Box<dyn Detector>,
        trigger: Option<AlertTrigger>,
        sink: CountingSink,
    ) -> DetectionSession<RecordingSurface> {
        DetectionSession::new(
            detector,
            OverlayRenderer::default(),
            AlertPolicy::new(trigger),
            Box::new(sink),
            RecordingSurface::new(),
        )
    }

    #[test]
    fn zero_sized_frame_skips_detection() {
        let log = EventLog::default();
        let detector = RecordingDetector {
            log: log.clone(),
            result: Vec::new(),
            fail: false,
            cancel_during: None,
        };
        let mut session = session(Box::new(detector), None, CountingSink::default());
        let mut stream = ScriptedStream::new(&[(0, 0), (640, 0), (4, 4)]);
        let mut scheduler = FrameScheduler::new(CancelToken::new());

        assert!(matches!(
            scheduler.step(&mut stream, &mut session),
            StepOutcome::Waiting
        ));
        assert_eq!(scheduler.state(), LoopState::WaitingForDimensions);
        assert!(matches!(
            scheduler.step(&mut stream, &mut session),
            StepOutcome::Waiting
        ));
        assert!(log.events().is_empty());
        assert!(session.surface().ops().is_empty());

        assert!(matches!(
            scheduler.step(&mut stream, &mut session),
            StepOutcome::Cycle(_)
        ));
        assert_eq!(log.events(), vec!["detect-begin 3", "detect-end 3"]);
        assert_eq!(scheduler.stats().waiting_ticks, 2);
    }

    #[test]
    fn detection_failure_renders_empty_and_keeps_going() {
        let log = EventLog::default();
        let detector = RecordingDetector {
            log: log.clone(),
            result: Vec::new(),
            fail: true,
            cancel_during: None,
        };
        let sink = CountingSink::default();
        let mut session = session(
            Box::new(detector),
            Some(AlertTrigger::new("cell phone", 0.5)),
            sink.clone(),
        );
        let mut stream = ScriptedStream::new(&[(6, 4)]);
        let mut scheduler = FrameScheduler::new(CancelToken::new());
        let mut ticks = CountedTicks {
            remaining: 2,
            log: None,
        };

        let mut reports = Vec::new();
        let reason = scheduler.run(&mut stream, &mut session, &mut ticks, |report, _, _| {
            reports.push(report.clone())
        });

        assert_eq!(reason, StopReason::TicksExhausted);
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.detect_failed && r.detections.is_empty()));
        assert_eq!(reports[0].render, RenderOutcome::Drawn { boxes: 0 });
        assert_eq!(
            &session.surface().ops()[..3],
            &[
                DrawOp::Resize {
                    width: 6,
                    height: 4
                },
                DrawOp::Clear,
                DrawOp::Image { sequence: 1 },
            ]
        );
        assert!(sink.0.lock().expect("sink").is_empty());
        assert_eq!(scheduler.stats().detect_failures, 3);
    }

    #[test]
    fn cycles_never_overlap() {
        let log = EventLog::default();
        let detector = RecordingDetector {
            log: log.clone(),
            result: Vec::new(),
            fail: false,
            cancel_during: None,
        };
        let mut session = session(Box::new(detector), None, CountingSink::default());
        let mut stream = ScriptedStream::new(&[(4, 4), (0, 0), (4, 4)]);
        let mut scheduler = FrameScheduler::new(CancelToken::new());
        let mut ticks = CountedTicks {
            remaining: 3,
            log: Some(log.clone()),
        };

        scheduler.run(&mut stream, &mut session, &mut ticks, |_, _, _| {});

        assert_eq!(
            log.events(),
            vec![
                "detect-begin 1",
                "detect-end 1",
                "tick",
                "tick",
                "detect-begin 3",
                "detect-end 3",
                "tick",
                "detect-begin 4",
                "detect-end 4",
            ]
        );
    }

    #[test]
    fn cancel_during_detection_discards_result() {
        let cancel = CancelToken::new();
        let detector = RecordingDetector {
            log: EventLog::default(),
            result: vec![Detection::new(
                "cell phone",
                0.95,
                BoundingBox::new(1.0, 1.0, 2.0, 2.0),
            )],
            fail: false,
            cancel_during: Some(cancel.clone()),
        };
        let sink = CountingSink::default();
        let mut session = session(
            Box::new(detector),
            Some(AlertTrigger::new("cell phone", 0.85)),
            sink.clone(),
        );
        let mut stream = ScriptedStream::new(&[(4, 4)]);
        let mut scheduler = FrameScheduler::new(cancel);

        assert!(matches!(
            scheduler.step(&mut stream, &mut session),
            StepOutcome::Stopped(StopReason::Cancelled)
        ));
        assert!(session.surface().ops().is_empty());
        assert!(sink.0.lock().expect("sink").is_empty());
        assert!(!session.alert_state().fired());
    }

    #[test]
    fn cancelled_scheduler_does_nothing() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut session = session(
            Box::new(StubBackend::default()),
            None,
            CountingSink::default(),
        );
        let mut stream = ScriptedStream::new(&[]);
        let mut scheduler = FrameScheduler::new(cancel);
        let mut ticks = CountedTicks {
            remaining: 5,
            log: None,
        };
        let reason = scheduler.run(&mut stream, &mut session, &mut ticks, |_, _, _| {});
        assert_eq!(reason, StopReason::Cancelled);
        assert_eq!(stream.sequence, 0);
    }

    #[test]
    fn detached_surface_stops_the_loop() {
        let mut session = session(
            Box::new(StubBackend::default()),
            None,
            CountingSink::default(),
        );
        session.surface_mut().detach();
        let mut stream = ScriptedStream::new(&[(4, 4)]);
        let mut scheduler = FrameScheduler::new(CancelToken::new());
        let mut ticks = CountedTicks {
            remaining: 5,
            log: None,
        };
        let reason = scheduler.run(&mut stream, &mut session, &mut ticks, |_, _, _| {});
        assert_eq!(reason, StopReason::SurfaceDetached);
        assert_eq!(stream.sequence, 1);
    }

    /// Stream whose reads always fail.
    struct FailingStream {
        reads: u64,
        healthy: bool,
    }

    impl VideoStream for FailingStream {
        fn wait_ready(&mut self, _timeout: Duration) -> Result<StreamMetadata> {
            Err(anyhow!("never ready"))
        }

        fn current_frame(&mut self) -> Result<Frame> {
            self.reads += 1;
            Err(anyhow!("device unplugged"))
        }

        fn release(&mut self) {}

        fn is_healthy(&self) -> bool {
            self.healthy
        }

        fn stats(&self) -> StreamStats {
            StreamStats {
                frames_captured: 0,
                source: "failing".to_string(),
            }
        }
    }

    #[test]
    fn unhealthy_stream_stops_the_loop() {
        let mut session = session(
            Box::new(StubBackend::default()),
            None,
            CountingSink::default(),
        );
        let mut stream = FailingStream {
            reads: 0,
            healthy: false,
        };
        let mut scheduler = FrameScheduler::new(CancelToken::new());
        let mut ticks = CountedTicks {
            remaining: 1000,
            log: None,
        };
        let reason = scheduler.run(&mut stream, &mut session, &mut ticks, |_, _, _| {});
        assert_eq!(reason, StopReason::SourceLost);
        assert_eq!(stream.reads, 1);
        assert_eq!(scheduler.stats().frame_errors, 1);
        assert_eq!(ticks.remaining, 1000);
    }

    #[test]
    fn repeated_read_failures_stop_the_loop() {
        let mut session = session(
            Box::new(StubBackend::default()),
            None,
            CountingSink::default(),
        );
        let mut stream = FailingStream {
            reads: 0,
            healthy: true,
        };
        let mut scheduler = FrameScheduler::new(CancelToken::new());
        let mut ticks = CountedTicks {
            remaining: 1000,
            log: None,
        };
        let reason = scheduler.run(&mut stream, &mut session, &mut ticks, |_, _, _| {});
        assert_eq!(reason, StopReason::SourceLost);
        assert_eq!(stream.reads, MAX_CONSECUTIVE_FRAME_ERRORS as u64);
        assert_eq!(
            scheduler.stats().frame_errors,
            MAX_CONSECUTIVE_FRAME_ERRORS as u64
        );
        assert!(session.surface().ops().is_empty());
    }

    /// Healthy stream that fails every other read.
    struct FlakyStream {
        inner: ScriptedStream,
        reads: u64,
    }

    impl VideoStream for FlakyStream {
        fn wait_ready(&mut self, timeout: Duration) -> Result<StreamMetadata> {
            self.inner.wait_ready(timeout)
        }

        fn current_frame(&mut self) -> Result<Frame> {
            self.reads += 1;
            if self.reads % 2 == 0 {
                return Err(anyhow!("dropped buffer"));
            }
            self.inner.current_frame()
        }

        fn release(&mut self) {}

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> StreamStats {
            self.inner.stats()
        }
    }

    #[test]
    fn intermittent_read_failures_keep_the_loop_running() {
        let mut session = session(
            Box::new(StubBackend::default()),
            None,
            CountingSink::default(),
        );
        let mut stream = FlakyStream {
            inner: ScriptedStream::new(&[]),
            reads: 0,
        };
        let mut scheduler = FrameScheduler::new(CancelToken::new());
        let ticks_granted = MAX_CONSECUTIVE_FRAME_ERRORS * 4;
        let mut ticks = CountedTicks {
            remaining: ticks_granted,
            log: None,
        };

        let mut observed = Vec::new();
        let reason = scheduler.run(&mut stream, &mut session, &mut ticks, |report, stats, _| {
            observed.push((report.stream_healthy, stats.cycles, stats.frame_errors))
        });

        assert_eq!(reason, StopReason::TicksExhausted);
        assert_eq!(scheduler.stats().frame_errors, ticks_granted as u64 / 2);
        assert_eq!(observed[0], (true, 1, 0));
        assert_eq!(observed[1], (true, 2, 1));
    }

    #[test]
    fn alert_fires_once_across_cycles() {
        let phone = Detection::new("cell phone", 0.9, BoundingBox::new(2.0, 2.0, 3.0, 3.0));
        let detector = StubBackend::scripted(vec![vec![phone.clone()], vec![], vec![phone]]);
        let sink = CountingSink::default();
        let mut session = session(
            Box::new(detector),
            Some(AlertTrigger::new("cell phone", 0.85)),
            sink.clone(),
        );
        let mut stream = ScriptedStream::new(&[]);
        let mut scheduler = FrameScheduler::new(CancelToken::new());
        let mut ticks = CountedTicks {
            remaining: 2,
            log: None,
        };

        let mut fired = Vec::new();
        scheduler.run(&mut stream, &mut session, &mut ticks, |report, _, _| {
            fired.push(report.alert_fired.clone())
        });

        assert_eq!(fired, vec![Some("cell phone".to_string()), None, None]);
        assert_eq!(*sink.0.lock().expect("sink"), vec!["cell phone".to_string()]);
    }

    #[test]
    fn refresh_clock_stops_on_cancel() {
        let cancel = CancelToken::new();
        let mut clock = RefreshClock::new(1000);
        assert_eq!(clock.period(), Duration::from_millis(1));
        assert!(clock.next_tick(&cancel));
        cancel.cancel();
        assert!(!clock.next_tick(&cancel));
    }

    #[test]
    fn refresh_clock_aligns_to_boundaries() {
        let clock = RefreshClock::new(50);
        let boundary = clock.next_boundary(clock.origin + Duration::from_millis(45));
        assert_eq!(boundary - clock.origin, Duration::from_millis(60));
    }
}
