//! OCR engine abstraction for running several recognizers side by side.
//!
//! Every engine exposes one capability, `recognize(page)`, returning
//! located text candidates. The ensemble runs all configured engines on
//! every page and reconciles their output.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{EngineKind, OcrConfig};
use crate::models::{BoundingBox, Page};

#[cfg(feature = "ocr-ocrs")]
use super::ocrs_backend::OcrsEngine;
use super::tesseract::TesseractEngine;

/// Errors from OCR engines.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Engine not available: {0}")]
    EngineNotAvailable(String),

    #[error("OCR failed: {0}")]
    OcrFailed(String),

    #[error("{engine} timed out after {secs}s")]
    Timeout { engine: String, secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    ImageError(String),
}

/// One engine's reading of a region of a page.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub bbox: BoundingBox,
    pub text: String,
    /// Engine-reported confidence in [0, 1].
    pub confidence: f32,
}

impl Candidate {
    pub fn new(bbox: BoundingBox, text: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            text: text.into(),
            confidence: clamp_confidence(confidence),
        }
    }
}

/// NaN reads as zero; everything else is clamped into `[0, 1]`.
pub(crate) fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// All candidates one engine produced for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResult {
    pub engine: String,
    /// Position of the engine in the configuration, used as the last tie-breaker.
    pub rank: usize,
    pub candidates: Vec<Candidate>,
}

/// Trait for OCR engines.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Unique engine name.
    fn name(&self) -> &str;

    /// Check if this engine can run (binaries installed, models present).
    fn is_available(&self) -> bool;

    /// Get a description of what's needed to make this engine available.
    fn availability_hint(&self) -> String;

    /// Recognize text on a rendered page.
    async fn recognize(&self, page: &Page) -> Result<Vec<Candidate>, OcrError>;
}

/// Check whether a binary is on `PATH`.
pub fn check_binary(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Stand-in for a configured engine this build cannot run.
pub struct DisabledEngine {
    name: String,
    hint: String,
}

impl DisabledEngine {
    pub fn new(name: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hint: hint.into(),
        }
    }
}

#[async_trait]
impl OcrEngine for DisabledEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        false
    }

    fn availability_hint(&self) -> String {
        self.hint.clone()
    }

    async fn recognize(&self, _page: &Page) -> Result<Vec<Candidate>, OcrError> {
        Err(OcrError::EngineNotAvailable(self.hint.clone()))
    }
}

/// Instantiate the engines named in the configuration, in order.
pub fn build_engines(config: &OcrConfig) -> Vec<Arc<dyn OcrEngine>> {
    config
        .engines
        .iter()
        .map(|entry| -> Arc<dyn OcrEngine> {
            match entry.kind {
                EngineKind::Tesseract => Arc::new(TesseractEngine::from_entry(entry)),
                #[cfg(feature = "ocr-ocrs")]
                EngineKind::Ocrs => Arc::new(OcrsEngine::from_entry(entry)),
                #[cfg(not(feature = "ocr-ocrs"))]
                EngineKind::Ocrs => Arc::new(DisabledEngine::new(
                    entry.name.clone(),
                    "Rebuild with --features ocr-ocrs",
                )),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineEntry;

    #[test]
    fn test_candidate_confidence_clamped() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(Candidate::new(bbox, "a", 1.4).confidence, 1.0);
        assert_eq!(Candidate::new(bbox, "a", f32::NAN).confidence, 0.0);
    }

    #[test]
    fn test_build_engines_preserves_order() {
        let config = OcrConfig::default();
        let engines = build_engines(&config);
        let names: Vec<&str> = engines.iter().map(|e| e.name()).collect();
        assert_eq!(&names[..2], ["tesseract-block", "tesseract-sparse"]);
        assert_eq!(names.len(), if cfg!(feature = "ocr-ocrs") { 3 } else { 2 });
    }

    #[tokio::test]
    async fn test_ocrs_entry_builds_engine() {
        let config = OcrConfig {
            engines: vec![EngineEntry::ocrs("neural")],
            ..OcrConfig::default()
        };
        let engines = build_engines(&config);
        assert_eq!(engines[0].name(), "neural");
        if !cfg!(feature = "ocr-ocrs") {
            assert!(!engines[0].is_available());
            let page = Page::new(0, image::GrayImage::new(8, 8));
            assert!(matches!(
                engines[0].recognize(&page).await,
                Err(OcrError::EngineNotAvailable(_))
            ));
        }
    }
}
