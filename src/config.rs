//! Configuration management for docsift.
//!
//! Settings come from an optional TOML file and are then overridden by
//! `DOCSIFT_*` environment variables. Every policy constant of the
//! pipeline (IoU threshold, weights, bonuses, progress weights) lives here
//! with a default so nothing downstream hard-codes it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ScoreWeights;

/// Config file name looked up in the working directory and user config dir.
pub const CONFIG_FILENAME: &str = "docsift.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Kind of OCR engine an entry instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Tesseract,
    /// Pure-Rust recognizer, available with the `ocr-ocrs` feature.
    Ocrs,
}

/// One configured OCR engine.
///
/// Distinct tesseract configurations (engine mode, page segmentation mode)
/// recognize differently enough to be used as separate ensemble members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEntry {
    /// Unique name used in provenance and tie-breaking.
    pub name: String,
    #[serde(default)]
    pub kind: EngineKind,
    #[serde(default = "default_language")]
    pub language: String,
    /// Tesseract page segmentation mode (`--psm`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psm: Option<u8>,
    /// Tesseract OCR engine mode (`--oem`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oem: Option<u8>,
    /// Per-page timeout, overriding `ocr.engine_timeout_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Model directory for model-based engines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,
}

fn default_language() -> String {
    "eng".to_string()
}

impl EngineEntry {
    pub fn tesseract(name: &str, psm: u8) -> Self {
        Self {
            name: name.to_string(),
            kind: EngineKind::Tesseract,
            language: default_language(),
            psm: Some(psm),
            oem: Some(1),
            timeout_secs: None,
            model_dir: None,
        }
    }

    pub fn ocrs(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EngineKind::Ocrs,
            language: default_language(),
            psm: None,
            oem: None,
            timeout_secs: None,
            model_dir: None,
        }
    }
}

fn default_engines() -> Vec<EngineEntry> {
    let mut engines = vec![
        EngineEntry::tesseract("tesseract-block", 6),
        EngineEntry::tesseract("tesseract-sparse", 11),
    ];
    if cfg!(feature = "ocr-ocrs") {
        engines.push(EngineEntry::ocrs("ocrs"));
    }
    engines
}

/// Strategy used to merge overlapping candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicyKind {
    /// Confidence-weighted plurality vote with agreement bonus.
    #[default]
    WeightedVote,
    /// Keep the single most confident candidate of each group.
    HighestConfidence,
}

impl MergePolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeightedVote => "weighted_vote",
            Self::HighestConfidence => "highest_confidence",
        }
    }
}

/// OCR ensemble configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub engines: Vec<EngineEntry>,
    /// Minimum IoU for two candidates to describe the same text.
    pub iou_threshold: f32,
    /// Bonus applied when two or more engines agree on identical text.
    pub agreement_bonus: f32,
    pub merge_policy: MergePolicyKind,
    pub engine_timeout_secs: u64,
    /// Rasterization resolution for PDF pages.
    pub pdf_dpi: u32,
    /// Contrast-stretch rasters before OCR.
    pub preprocess: bool,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            engines: default_engines(),
            iou_threshold: 0.5,
            agreement_bonus: 0.1,
            merge_policy: MergePolicyKind::WeightedVote,
            engine_timeout_secs: 60,
            pdf_dpi: 144,
            preprocess: true,
        }
    }
}

impl OcrConfig {
    pub fn engine_timeout(&self, entry: &EngineEntry) -> Duration {
        Duration::from_secs(entry.timeout_secs.unwrap_or(self.engine_timeout_secs))
    }
}

/// Progress share of each pipeline stage, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageWeights {
    pub ocr: u8,
    pub detection: u8,
    pub scoring: u8,
    pub validation: u8,
}

impl Default for StageWeights {
    fn default() -> Self {
        Self {
            ocr: 40,
            detection: 25,
            scoring: 15,
            validation: 20,
        }
    }
}

impl StageWeights {
    pub fn total(&self) -> u32 {
        self.ocr as u32 + self.detection as u32 + self.scoring as u32 + self.validation as u32
    }
}

/// Job orchestration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Jobs processed concurrently; the rest wait in `queued`.
    pub max_concurrent_jobs: usize,
    /// Pages of one job recognized concurrently.
    pub page_concurrency: usize,
    pub job_timeout_secs: u64,
    /// Terminal jobs older than this are evicted by the sweeper.
    pub retention_secs: u64,
    pub stage_weights: StageWeights,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            page_concurrency: 4,
            job_timeout_secs: 300,
            retention_secs: 3600,
            stage_weights: StageWeights::default(),
        }
    }
}

impl PipelineConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Layout heuristics for field detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Longest text still considered a label.
    pub max_label_chars: usize,
    pub max_label_words: usize,
    /// Farthest a value may sit from its label, as a fraction of page width.
    pub max_pair_distance: f32,
    /// Distances within this fraction of the best are considered equally plausible.
    pub ambiguity_tolerance: f32,
    /// Binarization threshold (0-255) for raster analysis.
    pub ink_threshold: u8,
    pub mark_min_px: u32,
    pub mark_max_px: u32,
    /// Allowed deviation of a mark's aspect ratio from 1.0.
    pub mark_square_tolerance: f32,
    /// Interior ink ratio above which a mark counts as filled.
    pub mark_fill_threshold: f32,
    pub signature_min_width_px: u32,
    pub signature_min_height_px: u32,
    /// Ink density range for handwritten strokes.
    pub signature_min_density: f32,
    pub signature_max_density: f32,
    /// Minimum overlap for a block to sit inside a template region.
    pub template_region_min_overlap: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_label_chars: 40,
            max_label_words: 5,
            max_pair_distance: 0.5,
            ambiguity_tolerance: 0.15,
            ink_threshold: 128,
            mark_min_px: 8,
            mark_max_px: 64,
            mark_square_tolerance: 0.25,
            mark_fill_threshold: 0.3,
            signature_min_width_px: 60,
            signature_min_height_px: 15,
            signature_min_density: 0.02,
            signature_max_density: 0.35,
            template_region_min_overlap: 0.3,
        }
    }
}

/// Confidence scoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    /// Layout confidence of a perfect template region match.
    pub template_layout: f32,
    /// Layout confidence of an unambiguous heuristic pairing.
    pub heuristic_layout: f32,
    pub raster_layout: f32,
    pub unpaired_layout: f32,
    /// OCR confidence assigned to fields with no value.
    pub empty_value_ocr: f32,
    /// Fields below this overall confidence are counted as low confidence.
    pub low_confidence_threshold: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            template_layout: 0.95,
            heuristic_layout: 0.75,
            raster_layout: 0.7,
            unpaired_layout: 0.3,
            empty_value_ocr: 0.2,
            low_confidence_threshold: 0.5,
        }
    }
}

/// Template learning and matching configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Fields below this confidence are not part of the stable layout.
    pub stable_confidence: f32,
    /// Grid resolution used to quantize regions before fingerprinting.
    pub fingerprint_grid: u32,
    /// Share of expected regions that must contain content to use a template.
    pub match_threshold: f32,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            stable_confidence: 0.7,
            fingerprint_grid: 20,
            match_threshold: 0.6,
        }
    }
}

/// Application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pipeline: PipelineConfig,
    pub ocr: OcrConfig,
    pub detection: DetectionConfig,
    pub scoring: ScoringConfig,
    pub templates: TemplateConfig,
}

impl Settings {
    /// Parse settings from TOML text.
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `DOCSIFT_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse::<usize>("DOCSIFT_MAX_JOBS")? {
            self.pipeline.max_concurrent_jobs = v;
        }
        if let Some(v) = env_parse::<u64>("DOCSIFT_JOB_TIMEOUT_SECS")? {
            self.pipeline.job_timeout_secs = v;
        }
        if let Some(v) = env_parse::<f32>("DOCSIFT_IOU_THRESHOLD")? {
            self.ocr.iou_threshold = v;
        }
        if let Ok(list) = std::env::var("DOCSIFT_ENGINES") {
            let engines = parse_engine_list(&list)?;
            if !engines.is_empty() {
                self.ocr.engines = engines;
            }
        }
        Ok(())
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ocr.engines.is_empty() {
            return Err(ConfigError::Invalid("at least one OCR engine is required".into()));
        }
        let mut names: Vec<&str> = self.ocr.engines.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.ocr.engines.len() {
            return Err(ConfigError::Invalid("OCR engine names must be unique".into()));
        }
        if !(0.0..=1.0).contains(&self.ocr.iou_threshold) {
            return Err(ConfigError::Invalid(format!(
                "ocr.iou_threshold must be within [0, 1], got {}",
                self.ocr.iou_threshold
            )));
        }
        if self.pipeline.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_concurrent_jobs must be at least 1".into(),
            ));
        }
        if self.pipeline.page_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.page_concurrency must be at least 1".into(),
            ));
        }
        if self.pipeline.stage_weights.total() == 0 {
            return Err(ConfigError::Invalid("stage weights sum to zero".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
        _ => Ok(None),
    }
}

/// Parse `name:psm,name:ocrs` into engine entries. A bare name is a
/// tesseract engine with psm 6.
fn parse_engine_list(list: &str) -> Result<Vec<EngineEntry>, ConfigError> {
    let mut engines = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, psm) = match item.split_once(':') {
            Some((name, "ocrs")) => {
                engines.push(EngineEntry::ocrs(name));
                continue;
            }
            Some((name, psm)) => {
                let psm = psm.parse::<u8>().map_err(|_| ConfigError::InvalidEnv {
                    key: "DOCSIFT_ENGINES".to_string(),
                    value: item.to_string(),
                })?;
                (name, psm)
            }
            None => (item, 6),
        };
        engines.push(EngineEntry::tesseract(name, psm));
    }
    Ok(engines)
}

/// Find the config file: explicit path, `DOCSIFT_CONFIG`, then the
/// working directory, then the user config directory.
fn find_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var("DOCSIFT_CONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    [
        Some(PathBuf::from(CONFIG_FILENAME)),
        dirs::config_dir().map(|d| d.join("docsift").join(CONFIG_FILENAME)),
    ]
    .into_iter()
    .flatten()
    .find(|p| p.exists())
}

/// Load settings from file (if any) and environment.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut settings = match find_config(explicit) {
        Some(path) => {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            tracing::debug!("Loaded config from {}", path.display());
            Settings::from_toml(&text, &path)?
        }
        None => Settings::default(),
    };
    settings.apply_env()?;
    settings.validate()?;
    Ok(settings)
}
