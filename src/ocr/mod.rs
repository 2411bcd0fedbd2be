//! OCR: document decoding, engine adapters and the reconciling ensemble.
//!
//! ## Engines
//!
//! Tesseract is the built-in engine. Several tesseract configurations
//! (page segmentation mode, engine mode) can run side by side as distinct
//! ensemble members. With the `ocr-ocrs` feature the pure-Rust OCRS
//! recognizer joins them. Anything implementing [`OcrEngine`] can join the
//! ensemble.

mod backend;
mod ensemble;
mod loader;
#[cfg(feature = "ocr-ocrs")]
mod ocrs_backend;
mod pdf_utils;
mod tesseract;

pub use backend::{
    build_engines, check_binary, Candidate, DisabledEngine, EngineResult, OcrEngine, OcrError,
};
pub use ensemble::{
    normalize_text, policy_for, reconcile, run_engines_on_page, AgreementTracker, EnsembleMember,
    GroupMember, HighestConfidencePolicy, MergeContext, MergePolicy, MergedBlock, OcrEnsemble,
    PageRecognition, ReconcileSettings, WeightedVotePolicy,
};
pub use loader::{detect_kind, load_document, preprocess, LoadError, LoadOptions};
#[cfg(feature = "ocr-ocrs")]
pub use ocrs_backend::OcrsEngine;
pub use pdf_utils::{find_page_image, rasterize_pdf};
pub use tesseract::TesseractEngine;
