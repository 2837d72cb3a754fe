//! live_detect - real-time object detection over a camera feed
//!
//! This binary:
//! 1. Acquires the configured camera while the detection model loads
//! 2. Waits for the stream to report its picture size
//! 3. Runs detect -> render -> alert once per refresh tick until Ctrl-C
//! 4. Optionally writes the overlay to an image snapshot as it goes
//! 5. Releases the camera on every exit path

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use live_detect::{
    config, detect, open_device, ui, AlertTrigger, CancelToken, ImageSurface, LiveDetectConfig,
    LogAlertSink, ModelLoader, RefreshClock, SessionController,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Detect objects in a live camera feed")]
struct Args {
    /// Capture source (stub://name, fail://reason, /dev/videoN).
    #[arg(long)]
    source: Option<String>,

    /// Raise a one-shot alert when this class is detected.
    #[arg(long, value_name = "CLASS")]
    alert_class: Option<String>,

    /// Minimum confidence for the alert (0..1).
    #[arg(long, value_name = "SCORE")]
    alert_min_confidence: Option<f32>,

    /// Stop after this many completed detection cycles.
    #[arg(long)]
    max_frames: Option<u64>,

    /// Write the overlay to this image file periodically.
    #[arg(long, value_name = "PATH")]
    snapshot: Option<PathBuf>,

    /// Do not ring the terminal bell on alert.
    #[arg(long)]
    no_bell: bool,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut cfg = {
        let _stage = ui.stage("Load configuration");
        let mut cfg = LiveDetectConfig::load()?;
        apply_args(&mut cfg, &args);
        cfg.validate()?;
        cfg
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, stopping frame loop...");
        handler_token.cancel();
    })
    .context("error setting Ctrl-C handler")?;

    let mut device = open_device(&cfg.source)?;
    let loader: Arc<dyn ModelLoader> = Arc::from(detect::model_loader(&cfg.detector)?);
    let controller =
        SessionController::new(cfg.session_settings(), cancel.clone()).with_ui(ui.clone());

    let mut active = controller.start(
        device.as_mut(),
        loader,
        ImageSurface::new(),
        Box::new(LogAlertSink::new(!args.no_bell)),
    )?;

    let snapshot_path = cfg.display.snapshot_path.take();
    let snapshot_every = cfg.display.snapshot_every;
    let max_frames = args.max_frames;
    let mut clock = RefreshClock::new(cfg.display.refresh_hz);
    let mut completed = 0u64;
    let mut last_health = Instant::now();
    log::info!("frame loop running at {} Hz (Ctrl-C to stop)", cfg.display.refresh_hz);

    active.run(&mut clock, |report, stats, session| {
        completed += 1;
        if let Some(path) = &snapshot_path {
            if completed % snapshot_every == 0 || report.alert_fired.is_some() {
                if let Err(err) = session.surface().save(path) {
                    log::warn!("snapshot failed: {:#}", err);
                }
            }
        }
        if last_health.elapsed() >= HEALTH_LOG_INTERVAL {
            last_health = Instant::now();
            log::info!(
                "health: cycles={} frame={} detections={} failures={} frame_errors={} inference={}ms detector={} stream={}",
                completed,
                report.sequence,
                report.detections.len(),
                stats.detect_failures,
                stats.frame_errors,
                report.inference.as_millis(),
                session.detector_name(),
                if report.stream_healthy { "ok" } else { "degraded" }
            );
        }
        if max_frames.is_some_and(|max| completed >= max) {
            cancel.cancel();
        }
    });

    let summary = active.teardown();
    println!(
        "stopped ({}): {} cycles, {} detections, {} detection failures, {} frame errors, {} frames captured, alert {}",
        summary
            .stop_reason
            .map(|reason| reason.to_string())
            .unwrap_or_else(|| "not started".to_string()),
        summary.stats.cycles,
        summary.stats.detections,
        summary.stats.detect_failures,
        summary.stats.frame_errors,
        summary.frames_captured,
        if summary.alert_fired { "fired" } else { "not fired" }
    );
    Ok(())
}

fn apply_args(cfg: &mut LiveDetectConfig, args: &Args) {
    if let Some(source) = &args.source {
        cfg.source.uri = source.clone();
    }
    if let Some(class_label) = &args.alert_class {
        let min_confidence = cfg
            .alert
            .as_ref()
            .map(|alert| alert.min_confidence)
            .unwrap_or(config::DEFAULT_ALERT_MIN_CONFIDENCE);
        cfg.alert = Some(AlertTrigger::new(class_label.clone(), min_confidence));
    }
    if let Some(min_confidence) = args.alert_min_confidence {
        match cfg.alert.as_mut() {
            Some(alert) => alert.min_confidence = min_confidence,
            None => log::warn!("--alert-min-confidence given without an alert class; ignoring"),
        }
    }
    if let Some(path) = &args.snapshot {
        cfg.display.snapshot_path = Some(path.clone());
    }
}
