use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alert::AlertTrigger;
use crate::capture::{SourceConfig, MAX_SOURCE_SIDE};
use crate::detect::{labels, DetectorSettings, KNOWN_BACKENDS};
use crate::overlay::OverlayStyle;
use crate::session::SessionSettings;

pub const DEFAULT_ALERT_MIN_CONFIDENCE: f32 = 0.85;
const DEFAULT_REFRESH_HZ: u32 = 60;
const DEFAULT_READY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SNAPSHOT_EVERY: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct LiveDetectConfigFile {
    source: Option<SourceConfigFile>,
    detector: Option<DetectorConfigFile>,
    alert: Option<AlertConfigFile>,
    display: Option<DisplayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    warmup_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    score_threshold: Option<f32>,
    stub_label: Option<String>,
    stub_confidence: Option<f32>,
    stub_fail_every: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    class_label: Option<String>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    refresh_hz: Option<u32>,
    ready_timeout_ms: Option<u64>,
    snapshot_path: Option<PathBuf>,
    snapshot_every: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LiveDetectConfig {
    pub source: SourceConfig,
    pub detector: DetectorSettings,
    /// `None` disables alerting.
    pub alert: Option<AlertTrigger>,
    pub display: DisplaySettings,
}

#[derive(Debug, Clone)]
pub struct DisplaySettings {
    pub refresh_hz: u32,
    pub ready_timeout: Duration,
    /// Write the overlay to this image file every `snapshot_every` cycles.
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_every: u64,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            refresh_hz: DEFAULT_REFRESH_HZ,
            ready_timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            snapshot_path: None,
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
        }
    }
}

impl Default for LiveDetectConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            detector: DetectorSettings::default(),
            alert: None,
            display: DisplaySettings::default(),
        }
    }
}

impl LiveDetectConfig {
    /// File named by `LIVE_DETECT_CONFIG` (if any), then env overrides, then
    /// validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LIVE_DETECT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LiveDetectConfigFile) -> Self {
        let source_defaults = SourceConfig::default();
        let source = file.source.unwrap_or_default();
        let source = SourceConfig {
            uri: source.uri.unwrap_or(source_defaults.uri),
            width: source.width.unwrap_or(source_defaults.width),
            height: source.height.unwrap_or(source_defaults.height),
            target_fps: source.target_fps.unwrap_or(source_defaults.target_fps),
            warmup_frames: source
                .warmup_frames
                .unwrap_or(source_defaults.warmup_frames),
        };

        let detector_defaults = DetectorSettings::default();
        let detector = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector.backend.unwrap_or(detector_defaults.backend),
            model_path: detector.model_path,
            input_size: detector.input_size.unwrap_or(detector_defaults.input_size),
            score_threshold: detector
                .score_threshold
                .unwrap_or(detector_defaults.score_threshold),
            stub_label: detector.stub_label.unwrap_or(detector_defaults.stub_label),
            stub_confidence: detector
                .stub_confidence
                .unwrap_or(detector_defaults.stub_confidence),
            stub_fail_every: detector
                .stub_fail_every
                .unwrap_or(detector_defaults.stub_fail_every),
        };

        let alert = file.alert.and_then(|alert| {
            alert.class_label.map(|class_label| {
                AlertTrigger::new(
                    class_label,
                    alert.min_confidence.unwrap_or(DEFAULT_ALERT_MIN_CONFIDENCE),
                )
            })
        });

        let display = file.display.unwrap_or_default();
        let display = DisplaySettings {
            refresh_hz: display.refresh_hz.unwrap_or(DEFAULT_REFRESH_HZ),
            ready_timeout: Duration::from_millis(
                display.ready_timeout_ms.unwrap_or(DEFAULT_READY_TIMEOUT_MS),
            ),
            snapshot_path: display.snapshot_path,
            snapshot_every: display.snapshot_every.unwrap_or(DEFAULT_SNAPSHOT_EVERY),
        };

        Self {
            source,
            detector,
            alert,
            display,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(uri) = non_empty_env("LIVE_DETECT_SOURCE") {
            self.source.uri = uri;
        }
        if let Some(backend) = non_empty_env("LIVE_DETECT_BACKEND") {
            self.detector.backend = backend;
        }
        if let Some(path) = non_empty_env("LIVE_DETECT_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(class_label) = non_empty_env("LIVE_DETECT_ALERT_CLASS") {
            let min_confidence = self
                .alert
                .as_ref()
                .map(|alert| alert.min_confidence)
                .unwrap_or(DEFAULT_ALERT_MIN_CONFIDENCE);
            self.alert = Some(AlertTrigger::new(class_label, min_confidence));
        }
        if let Some(raw) = non_empty_env("LIVE_DETECT_ALERT_MIN_CONFIDENCE") {
            let min_confidence: f32 = raw.trim().parse().map_err(|_| {
                anyhow!("LIVE_DETECT_ALERT_MIN_CONFIDENCE must be a number between 0 and 1")
            })?;
            match self.alert.as_mut() {
                Some(alert) => alert.min_confidence = min_confidence,
                None => log::warn!(
                    "LIVE_DETECT_ALERT_MIN_CONFIDENCE set without an alert class; ignoring"
                ),
            }
        }
        if let Some(path) = non_empty_env("LIVE_DETECT_SNAPSHOT_PATH") {
            self.display.snapshot_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Check ranges. Call again after applying CLI overrides.
    pub fn validate(&mut self) -> Result<()> {
        self.source.uri = self.source.uri.trim().to_string();
        if self.source.uri.is_empty() {
            return Err(anyhow!("source.uri must not be empty"));
        }
        let (width, height) = (self.source.width, self.source.height);
        if width == 0 || height == 0 || width > MAX_SOURCE_SIDE || height > MAX_SOURCE_SIDE {
            return Err(anyhow!(
                "source size {}x{} out of range (1..={} per side)",
                width,
                height,
                MAX_SOURCE_SIDE
            ));
        }
        if !KNOWN_BACKENDS.contains(&self.detector.backend.as_str()) {
            return Err(anyhow!(
                "unknown detector backend '{}' (expected one of {:?})",
                self.detector.backend,
                KNOWN_BACKENDS
            ));
        }
        if !(0.0..=1.0).contains(&self.detector.score_threshold) {
            return Err(anyhow!("detector.score_threshold must be between 0 and 1"));
        }
        if let Some(alert) = &mut self.alert {
            alert.class_label = alert.class_label.trim().to_string();
            if alert.class_label.is_empty() {
                return Err(anyhow!("alert.class_label must not be empty"));
            }
            if !(0.0..=1.0).contains(&alert.min_confidence) {
                return Err(anyhow!("alert.min_confidence must be between 0 and 1"));
            }
            if !labels::is_known_label(&alert.class_label) {
                log::warn!(
                    "alert class '{}' is not a COCO label; it will only fire if the detector emits it",
                    alert.class_label
                );
            }
        }
        if self.display.refresh_hz == 0 {
            return Err(anyhow!("display.refresh_hz must be greater than zero"));
        }
        if self.display.ready_timeout.is_zero() {
            return Err(anyhow!("display.ready_timeout_ms must be greater than zero"));
        }
        if self.display.snapshot_every == 0 {
            return Err(anyhow!("display.snapshot_every must be greater than zero"));
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            ready_timeout: self.display.ready_timeout,
            trigger: self.alert.clone(),
            style: OverlayStyle::default(),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<LiveDetectConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
