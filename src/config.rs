use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::annotate::{AnnotatorStyle, DEFAULT_FONT_SIZE, DEFAULT_LINE_WIDTH};
use crate::flush::FlushMode;
use crate::pipeline::{
    PipelineConfig, DEFAULT_BUFFER_WARN_RECORDS, DEFAULT_CONFIDENCE_THRESHOLD,
    DEFAULT_MAX_FLUSH_RETRIES,
};

const DEFAULT_DB_PATH: &str = "inference_log.db";
const DEFAULT_DETECTOR: &str = "motion";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_COMMIT_INTERVAL_SECS: f64 = 2.0;

#[derive(Debug, Deserialize, Default)]
struct SettingsFile {
    db_path: Option<String>,
    detector: Option<DetectorFile>,
    inference: Option<InferenceFile>,
    annotate: Option<AnnotateFile>,
    persistence: Option<PersistenceFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    class_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceFile {
    confidence_threshold: Option<f32>,
    frame_skip: Option<u32>,
    frame_rate_override: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotateFile {
    line_width: Option<u32>,
    font_size: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct PersistenceFile {
    commit_interval_seconds: Option<f64>,
    max_flush_retries: Option<u32>,
    buffer_warn_records: Option<usize>,
    flush_mode: Option<FlushMode>,
}

/// Effective settings: file, then `INFERENCE_LOG_*` environment, then
/// whatever the binary applies from its command line.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub db_path: String,
    pub detector: DetectorSettings,
    pub confidence_threshold: f32,
    pub frame_skip: Option<u32>,
    pub frame_rate_override: Option<f64>,
    pub line_width: u32,
    pub font_size: f32,
    pub commit_interval: Duration,
    pub max_flush_retries: u32,
    pub buffer_warn_records: usize,
    pub flush_mode: FlushMode,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub class_names: Vec<String>,
}

impl PipelineSettings {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("INFERENCE_LOG_CONFIG").ok();
        let file_cfg = match config_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SettingsFile) -> Result<Self> {
        let detector = file.detector.unwrap_or_default();
        let inference = file.inference.unwrap_or_default();
        let annotate = file.annotate.unwrap_or_default();
        let persistence = file.persistence.unwrap_or_default();
        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detector.model_path,
                input_size: detector.input_size.unwrap_or(DEFAULT_MODEL_INPUT),
                class_names: detector.class_names.unwrap_or_default(),
            },
            confidence_threshold: inference
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            frame_skip: inference.frame_skip,
            frame_rate_override: inference.frame_rate_override,
            line_width: annotate.line_width.unwrap_or(DEFAULT_LINE_WIDTH),
            font_size: annotate.font_size.unwrap_or(DEFAULT_FONT_SIZE),
            commit_interval: seconds(
                persistence
                    .commit_interval_seconds
                    .unwrap_or(DEFAULT_COMMIT_INTERVAL_SECS),
                "commit_interval_seconds",
            )?,
            max_flush_retries: persistence
                .max_flush_retries
                .unwrap_or(DEFAULT_MAX_FLUSH_RETRIES),
            buffer_warn_records: persistence
                .buffer_warn_records
                .unwrap_or(DEFAULT_BUFFER_WARN_RECORDS),
            flush_mode: persistence.flush_mode.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("INFERENCE_LOG_DB_PATH") {
            self.db_path = path;
        }
        if let Some(backend) = env_value("INFERENCE_LOG_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_value("INFERENCE_LOG_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(names) = env_value("INFERENCE_LOG_CLASS_NAMES") {
            self.detector.class_names = split_csv(&names);
        }
        if let Some(v) = env_value("INFERENCE_LOG_CONFIDENCE") {
            self.confidence_threshold = v
                .parse()
                .map_err(|_| anyhow!("INFERENCE_LOG_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Some(v) = env_value("INFERENCE_LOG_FRAME_SKIP") {
            self.frame_skip = Some(
                v.parse()
                    .map_err(|_| anyhow!("INFERENCE_LOG_FRAME_SKIP must be a positive integer"))?,
            );
        }
        if let Some(v) = env_value("INFERENCE_LOG_FRAME_RATE") {
            self.frame_rate_override = Some(
                v.parse()
                    .map_err(|_| anyhow!("INFERENCE_LOG_FRAME_RATE must be a number"))?,
            );
        }
        if let Some(v) = env_value("INFERENCE_LOG_LINE_WIDTH") {
            self.line_width = v
                .parse()
                .map_err(|_| anyhow!("INFERENCE_LOG_LINE_WIDTH must be a positive integer"))?;
        }
        if let Some(v) = env_value("INFERENCE_LOG_FONT_SIZE") {
            self.font_size = v
                .parse()
                .map_err(|_| anyhow!("INFERENCE_LOG_FONT_SIZE must be a number"))?;
        }
        if let Some(v) = env_value("INFERENCE_LOG_COMMIT_INTERVAL_SECS") {
            let secs: f64 = v.parse().map_err(|_| {
                anyhow!("INFERENCE_LOG_COMMIT_INTERVAL_SECS must be a number of seconds")
            })?;
            self.commit_interval = seconds(secs, "INFERENCE_LOG_COMMIT_INTERVAL_SECS")?;
        }
        if let Some(v) = env_value("INFERENCE_LOG_MAX_FLUSH_RETRIES") {
            self.max_flush_retries = v
                .parse()
                .map_err(|_| anyhow!("INFERENCE_LOG_MAX_FLUSH_RETRIES must be an integer"))?;
        }
        if let Some(v) = env_value("INFERENCE_LOG_FLUSH_MODE") {
            self.flush_mode = v.parse()?;
        }
        Ok(())
    }

    /// Reject out-of-range values. Binaries call this again after applying
    /// command-line overrides.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.frame_skip == Some(0) {
            return Err(anyhow!("frame_skip must be greater than zero"));
        }
        if let Some(rate) = self.frame_rate_override {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(anyhow!("frame_rate_override must be greater than zero"));
            }
        }
        if self.line_width == 0 {
            return Err(anyhow!("line_width must be greater than zero"));
        }
        if !(self.font_size.is_finite() && self.font_size > 0.0) {
            return Err(anyhow!("font_size must be greater than zero"));
        }
        if self.commit_interval.is_zero() {
            return Err(anyhow!("commit interval must be greater than zero"));
        }
        if self.detector.backend.trim().is_empty() {
            return Err(anyhow!("detector backend must not be empty"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input_size must be greater than zero"));
        }
        Ok(())
    }

    /// Pipeline configuration for one source.
    pub fn pipeline_config(&self, source_path: &str) -> PipelineConfig {
        PipelineConfig {
            confidence_threshold: self.confidence_threshold,
            frame_skip: self.frame_skip,
            frame_rate_override: self.frame_rate_override,
            style: AnnotatorStyle {
                line_width: self.line_width,
                font_size: self.font_size,
            },
            commit_interval: self.commit_interval,
            max_flush_retries: self.max_flush_retries,
            buffer_warn_records: self.buffer_warn_records,
            flush_mode: self.flush_mode,
            ..PipelineConfig::for_source(source_path)
        }
    }
}

fn read_config_file(path: &Path) -> Result<SettingsFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn seconds(value: f64, name: &str) -> Result<Duration> {
    if !(value.is_finite() && value > 0.0) {
        return Err(anyhow!("{} must be greater than zero", name));
    }
    Ok(Duration::from_secs_f64(value))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
