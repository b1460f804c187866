use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::annotate::{
    AlertPolicy, Annotator, DEFAULT_ALERT_LABELS, DEFAULT_CONFIDENCE_THRESHOLD,
    DEFAULT_NOMINAL_LABELS,
};
use crate::labels::LabelMap;
use crate::report::ReportOptions;
use crate::session::{
    DetectorErrorPolicy, LoopSettings, DEFAULT_FALLBACK_FPS, DEFAULT_FLUSH_INTERVAL_FRAMES,
};

const DEFAULT_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_DB_PATH: &str = "video_analytics.db";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_MODEL_PATH: &str = "models/best.onnx";
const DEFAULT_BACKEND: &str = "tract";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_CANDIDATE_FLOOR: f32 = 0.25;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_FRAME_DELAY_MS: u64 = 100;

#[derive(Debug, Deserialize, Default)]
struct AppConfigFile {
    server: Option<ServerConfigFile>,
    storage: Option<StorageConfigFile>,
    model: Option<ModelConfigFile>,
    analysis: Option<AnalysisConfigFile>,
    report: Option<ReportConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
    max_upload_bytes: Option<u64>,
    frame_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    db_path: Option<String>,
    upload_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    backend: Option<String>,
    path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    script_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    iou_threshold: Option<f32>,
    candidate_floor: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct AnalysisConfigFile {
    confidence_threshold: Option<f32>,
    alert_labels: Option<Vec<String>>,
    nominal_labels: Option<Vec<String>>,
    flush_interval_frames: Option<u64>,
    fallback_fps: Option<f64>,
    on_detector_error: Option<String>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ReportConfigFile {
    title: Option<String>,
    organization: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub model: ModelSettings,
    pub analysis: AnalysisSettings,
    pub report: ReportOptions,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: String,
    pub max_upload_bytes: u64,
    pub frame_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub db_path: String,
    pub upload_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// `tract` for ONNX inference, `scripted` to replay `script_path`.
    pub backend: String,
    pub path: PathBuf,
    pub labels_path: Option<PathBuf>,
    /// JSON list of per-frame detection lists for the scripted backend.
    /// Without one the scripted backend detects nothing.
    pub script_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub iou_threshold: f32,
    pub candidate_floor: f32,
}

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub policy: AlertPolicy,
    pub flush_interval_frames: u64,
    pub fallback_fps: f64,
    pub on_detector_error: DetectorErrorPolicy,
    pub font_path: Option<PathBuf>,
}

impl ModelSettings {
    /// The configured label map, or the built-in one.
    pub fn labels(&self) -> Result<LabelMap> {
        match &self.labels_path {
            Some(path) => LabelMap::from_json_file(path),
            None => Ok(LabelMap::default()),
        }
    }
}

impl AnalysisSettings {
    pub fn annotator(&self) -> Result<Annotator> {
        let annotator = Annotator::new(self.policy.clone());
        match &self.font_path {
            Some(path) => annotator.with_font_file(path),
            None => Ok(annotator),
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            flush_interval_frames: self.flush_interval_frames,
            fallback_fps: self.fallback_fps,
            on_detector_error: self.on_detector_error,
            ..LoopSettings::default()
        }
    }
}

impl AppConfig {
    /// Defaults, then the file named by `VIDEO_ANALYTICS_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VIDEO_ANALYTICS_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => read_config_file(Path::new(path))?,
            _ => AppConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Result<Self> {
        let server = file.server.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let analysis = file.analysis.unwrap_or_default();
        let report = file.report.unwrap_or_default();

        let on_detector_error = match analysis.on_detector_error.as_deref() {
            Some(value) => value.parse()?,
            None => DetectorErrorPolicy::default(),
        };
        let defaults = ReportOptions::default();

        Ok(Self {
            server: ServerSettings {
                addr: server.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
                max_upload_bytes: server.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
                frame_delay: Duration::from_millis(
                    server.frame_delay_ms.unwrap_or(DEFAULT_FRAME_DELAY_MS),
                ),
            },
            storage: StorageSettings {
                db_path: storage
                    .db_path
                    .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
                upload_dir: storage
                    .upload_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            },
            model: ModelSettings {
                backend: model.backend.unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                path: model
                    .path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                labels_path: model.labels_path,
                script_path: model.script_path,
                input_width: model.input_width.unwrap_or(DEFAULT_INPUT_SIZE),
                input_height: model.input_height.unwrap_or(DEFAULT_INPUT_SIZE),
                iou_threshold: model.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
                candidate_floor: model.candidate_floor.unwrap_or(DEFAULT_CANDIDATE_FLOOR),
            },
            analysis: AnalysisSettings {
                policy: AlertPolicy {
                    confidence_threshold: analysis
                        .confidence_threshold
                        .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                    alert_labels: label_set(analysis.alert_labels, DEFAULT_ALERT_LABELS),
                    nominal_labels: label_set(analysis.nominal_labels, DEFAULT_NOMINAL_LABELS),
                },
                flush_interval_frames: analysis
                    .flush_interval_frames
                    .unwrap_or(DEFAULT_FLUSH_INTERVAL_FRAMES),
                fallback_fps: analysis.fallback_fps.unwrap_or(DEFAULT_FALLBACK_FPS),
                on_detector_error,
                font_path: analysis.font_path,
            },
            report: ReportOptions {
                title: report.title.unwrap_or(defaults.title),
                organization: report.organization.unwrap_or(defaults.organization),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("PORT") {
            if !port.trim().is_empty() {
                let port: u16 = port
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("PORT must be a TCP port number"))?;
                self.server.addr = format!("0.0.0.0:{port}");
            }
        }
        if let Ok(addr) = std::env::var("VIDEO_ANALYTICS_ADDR") {
            if !addr.trim().is_empty() {
                self.server.addr = addr;
            }
        }
        if let Ok(db_path) = std::env::var("VIDEO_ANALYTICS_DB") {
            if !db_path.trim().is_empty() {
                self.storage.db_path = db_path;
            }
        }
        if let Ok(dir) = std::env::var("VIDEO_ANALYTICS_UPLOAD_DIR") {
            if !dir.trim().is_empty() {
                self.storage.upload_dir = PathBuf::from(dir);
            }
        }
        if let Ok(model) = std::env::var("VIDEO_ANALYTICS_MODEL") {
            if !model.trim().is_empty() {
                self.model.path = PathBuf::from(model);
            }
        }
        if let Ok(labels) = std::env::var("VIDEO_ANALYTICS_LABELS") {
            if !labels.trim().is_empty() {
                self.model.labels_path = Some(PathBuf::from(labels));
            }
        }
        if let Ok(threshold) = std::env::var("VIDEO_ANALYTICS_THRESHOLD") {
            self.analysis.policy.confidence_threshold = threshold.trim().parse().map_err(|_| {
                anyhow!("VIDEO_ANALYTICS_THRESHOLD must be a number between 0 and 1")
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let threshold = self.analysis.policy.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence threshold {} is outside [0, 1]",
                threshold
            ));
        }
        if !(self.analysis.fallback_fps.is_finite() && self.analysis.fallback_fps > 0.0) {
            return Err(anyhow!("fallback_fps must be greater than zero"));
        }
        if self.model.input_width == 0 || self.model.input_height == 0 {
            return Err(anyhow!("model input size must be non-zero"));
        }
        if !matches!(self.model.backend.as_str(), "tract" | "scripted") {
            return Err(anyhow!(
                "unknown detector backend '{}' (expected tract or scripted)",
                self.model.backend
            ));
        }
        if self.server.max_upload_bytes == 0 {
            return Err(anyhow!("max_upload_bytes must be greater than zero"));
        }
        Ok(())
    }
}

fn label_set(configured: Option<Vec<String>>, defaults: &[&str]) -> BTreeSet<String> {
    match configured {
        Some(labels) => labels
            .into_iter()
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
            .collect(),
        None => defaults.iter().map(|label| label.to_string()).collect(),
    }
}

fn read_config_file(path: &Path) -> Result<AppConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
