//! Document analysis: field detection, scoring, validation and templates.

mod detector;
mod raster;
mod scoring;
mod templates;
mod validation;

pub use detector::{classify_label, dedupe_names, slugify, DetectedField, DetectionMode, FieldDetector};
pub use raster::{
    binarize, classify_mark, find_marks, find_signature_regions, Mark, MarkShape, SignatureRegion,
};
pub use scoring::ConfidenceScorer;
pub use templates::{fingerprint, match_score, LearnOutcome, TemplateLearner, TemplateStore};
pub use validation::{parse_date, parse_number, RuleError, ValidationEngine};
