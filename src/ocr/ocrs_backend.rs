//! OCRS engine: pure-Rust text detection and recognition.
//!
//! Needs `text-detection.rten` and `text-recognition.rten` in the model
//! directory (the entry's `model_dir`, or `<data dir>/docsift/ocrs`).
//! Both are published at https://ocrs-models.s3-accelerate.amazonaws.com/.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use image::{DynamicImage, GrayImage};
use ocrs::{ImageSource, OcrEngineParams, TextItem};

use crate::config::EngineEntry;
use crate::models::{BoundingBox, Page};

use super::backend::{Candidate, OcrEngine, OcrError};

const DETECTION_MODEL: &str = "text-detection.rten";
const RECOGNITION_MODEL: &str = "text-recognition.rten";
const MODEL_URL: &str = "https://ocrs-models.s3-accelerate.amazonaws.com/";

/// ocrs does not score its output, so every line gets this confidence.
const LINE_CONFIDENCE: f32 = 0.75;

/// Loaded once per engine, on the first page it reads.
struct ModelSlot {
    dir: PathBuf,
    engine: OnceLock<ocrs::OcrEngine>,
}

impl ModelSlot {
    fn files_present(&self) -> bool {
        self.dir.join(DETECTION_MODEL).is_file() && self.dir.join(RECOGNITION_MODEL).is_file()
    }

    fn get_or_load(&self) -> Result<&ocrs::OcrEngine, OcrError> {
        if let Some(engine) = self.engine.get() {
            return Ok(engine);
        }
        if !self.files_present() {
            return Err(OcrError::EngineNotAvailable(format!(
                "ocrs models missing in {}",
                self.dir.display()
            )));
        }

        let detection_model = rten::Model::load_file(&self.dir.join(DETECTION_MODEL))
            .map_err(|e| OcrError::OcrFailed(format!("Failed to load detection model: {}", e)))?;
        let recognition_model = rten::Model::load_file(&self.dir.join(RECOGNITION_MODEL))
            .map_err(|e| OcrError::OcrFailed(format!("Failed to load recognition model: {}", e)))?;
        let engine = ocrs::OcrEngine::new(OcrEngineParams {
            detection_model: Some(detection_model),
            recognition_model: Some(recognition_model),
            ..Default::default()
        })
        .map_err(|e| OcrError::OcrFailed(format!("Failed to create OCR engine: {}", e)))?;

        // Another page may have won the race; either copy is fine.
        let _ = self.engine.set(engine);
        self.engine
            .get()
            .ok_or_else(|| OcrError::OcrFailed("Failed to cache OCR engine".to_string()))
    }
}

/// OCRS engine reporting one candidate per recognized text line.
pub struct OcrsEngine {
    name: String,
    models: Arc<ModelSlot>,
}

impl OcrsEngine {
    pub fn new(name: impl Into<String>, model_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            models: Arc::new(ModelSlot {
                dir: model_dir.into(),
                engine: OnceLock::new(),
            }),
        }
    }

    pub fn from_entry(entry: &EngineEntry) -> Self {
        let dir = entry.model_dir.clone().unwrap_or_else(default_model_dir);
        Self::new(entry.name.clone(), dir)
    }

    pub fn model_dir(&self) -> &Path {
        &self.models.dir
    }
}

fn default_model_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docsift")
        .join("ocrs")
}

fn read_lines(engine: &ocrs::OcrEngine, raster: &GrayImage) -> Result<Vec<Candidate>, OcrError> {
    let rgb = DynamicImage::ImageLuma8(raster.clone()).to_rgb8();
    let source = ImageSource::from_bytes(rgb.as_raw(), rgb.dimensions())
        .map_err(|e| OcrError::ImageError(format!("Failed to convert image: {}", e)))?;
    let input = engine
        .prepare_input(source)
        .map_err(|e| OcrError::OcrFailed(format!("Failed to prepare input: {}", e)))?;

    let words = engine
        .detect_words(&input)
        .map_err(|e| OcrError::OcrFailed(format!("Failed to detect words: {}", e)))?;
    let lines = engine.find_text_lines(&input, &words);
    let recognized = engine
        .recognize_text(&input, &lines)
        .map_err(|e| OcrError::OcrFailed(format!("Failed to recognize text: {}", e)))?;

    Ok(recognized
        .iter()
        .flatten()
        .filter_map(|line| {
            let text = line.to_string();
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            let rect = line.bounding_rect();
            let bbox = BoundingBox::new(
                rect.left() as f32,
                rect.top() as f32,
                rect.width() as f32,
                rect.height() as f32,
            );
            Some(Candidate::new(bbox, text, LINE_CONFIDENCE))
        })
        .collect())
}

#[async_trait]
impl OcrEngine for OcrsEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.models.files_present()
    }

    fn availability_hint(&self) -> String {
        if self.is_available() {
            format!("Models found in {}", self.models.dir.display())
        } else {
            format!(
                "Download {} and {} from {} into {}",
                DETECTION_MODEL,
                RECOGNITION_MODEL,
                MODEL_URL,
                self.models.dir.display()
            )
        }
    }

    async fn recognize(&self, page: &Page) -> Result<Vec<Candidate>, OcrError> {
        let models = self.models.clone();
        let raster = page.raster.clone();
        tokio::task::spawn_blocking(move || {
            let engine = models.get_or_load()?;
            read_lines(engine, &raster)
        })
        .await
        .map_err(|e| OcrError::OcrFailed(format!("ocrs task failed: {}", e)))?
    }
}
