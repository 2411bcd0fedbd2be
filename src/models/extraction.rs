//! Extraction artifacts: text blocks, fields, confidence scores and the
//! finalized per-job result record.

use serde::{Deserialize, Serialize};

use super::document::PageGeometry;
use super::geometry::BoundingBox;
use super::template::TemplateId;
use super::validation::ValidationSummary;

/// One engine's reading of a reconciled block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineContribution {
    pub engine: String,
    pub text: String,
    pub confidence: f32,
    /// Whether this engine's text matched the chosen text.
    pub agreed: bool,
}

/// A reconciled region of recognized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// Position in the document-wide block list.
    pub id: usize,
    pub page: usize,
    pub bbox: BoundingBox,
    pub text: String,
    pub ocr_confidence: f32,
    pub contributions: Vec<EngineContribution>,
}

impl TextBlock {
    /// Engines whose reading matched the chosen text.
    pub fn agreed_engines(&self) -> Vec<&str> {
        self.contributions
            .iter()
            .filter(|c| c.agreed)
            .map(|c| c.engine.as_str())
            .collect()
    }
}

/// Kind of form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Checkbox,
    Radio,
    Signature,
    Date,
    Number,
    Email,
    Phone,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Checkbox => "checkbox",
            Self::Radio => "radio",
            Self::Signature => "signature",
            Self::Date => "date",
            Self::Number => "number",
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" => Some(Self::Text),
            "checkbox" => Some(Self::Checkbox),
            "radio" => Some(Self::Radio),
            "signature" => Some(Self::Signature),
            "date" => Some(Self::Date),
            "number" | "numeric" => Some(Self::Number),
            "email" => Some(Self::Email),
            "phone" => Some(Self::Phone),
            _ => None,
        }
    }

    /// Whether the value comes from raster marks rather than recognized text.
    pub fn is_mark(&self) -> bool {
        matches!(self, Self::Checkbox | Self::Radio | Self::Signature)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Extracted value, typed by the field kind.
///
/// Text-like fields (text, date, number, email, phone) keep the raw
/// recognized string; parsing is exposed through accessors so the
/// extracted value itself is never rewritten. Mark fields carry a flag:
/// checked/selected for checkbox and radio, present for signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Flag(bool),
}

impl FieldValue {
    pub fn empty() -> Self {
        FieldValue::Text(String::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Flag(_) => false,
        }
    }

    /// Render the value as a string for display and export.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Flag(b) => b.to_string(),
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(b) => Some(*b),
            FieldValue::Text(_) => None,
        }
    }
}

/// Weights used to fold the three confidence dimensions into `overall`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub ocr: f32,
    pub layout: f32,
    pub validation: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            ocr: 0.5,
            layout: 0.3,
            validation: 0.2,
        }
    }
}

/// Multi-dimensional confidence.
///
/// `overall` is derived from the components at construction and every time
/// a component is replaced; there is no setter for it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceScore {
    ocr_confidence: f32,
    layout_confidence: f32,
    validation_confidence: Option<f32>,
    overall: f32,
}

impl ConfidenceScore {
    pub fn new(
        ocr_confidence: f32,
        layout_confidence: f32,
        validation_confidence: Option<f32>,
        weights: &ScoreWeights,
    ) -> Self {
        let ocr_confidence = clamp_unit(ocr_confidence);
        let layout_confidence = clamp_unit(layout_confidence);
        let validation_confidence = validation_confidence.map(clamp_unit);
        Self {
            ocr_confidence,
            layout_confidence,
            validation_confidence,
            overall: aggregate(ocr_confidence, layout_confidence, validation_confidence, weights),
        }
    }

    pub fn ocr_confidence(&self) -> f32 {
        self.ocr_confidence
    }

    pub fn layout_confidence(&self) -> f32 {
        self.layout_confidence
    }

    pub fn validation_confidence(&self) -> Option<f32> {
        self.validation_confidence
    }

    pub fn overall(&self) -> f32 {
        self.overall
    }

    /// Same score with the validation dimension replaced.
    pub fn with_validation(&self, validation: f32, weights: &ScoreWeights) -> Self {
        Self::new(
            self.ocr_confidence,
            self.layout_confidence,
            Some(validation),
            weights,
        )
    }

    /// Recompute `overall` from the stored components.
    pub fn recompute(&self, weights: &ScoreWeights) -> Self {
        Self::new(
            self.ocr_confidence,
            self.layout_confidence,
            self.validation_confidence,
            weights,
        )
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Weighted mean of the components; missing validation counts as 1.0.
fn aggregate(ocr: f32, layout: f32, validation: Option<f32>, weights: &ScoreWeights) -> f32 {
    let w_ocr = weights.ocr.max(0.0);
    let w_layout = weights.layout.max(0.0);
    let w_validation = weights.validation.max(0.0);
    let total = w_ocr + w_layout + w_validation;
    if total <= 0.0 {
        return 0.0;
    }
    let sum = w_ocr * ocr + w_layout * layout + w_validation * validation.unwrap_or(1.0);
    clamp_unit(sum / total)
}

/// How a field's geometry was established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum FieldOrigin {
    /// Matched an expected region of a template.
    Template {
        template_id: TemplateId,
        field_index: usize,
        region_overlap: f32,
    },
    /// Label/value pairing by layout heuristics.
    Heuristic {
        /// Equally plausible alternative value blocks that were not chosen.
        alternatives: usize,
    },
    /// Checkbox, radio or signature found in the raster.
    Raster,
    /// A label with no value block found.
    Unpaired,
}

/// A typed, located, valued unit extracted from a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub value: FieldValue,
    pub page: usize,
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_bbox: Option<BoundingBox>,
    /// Ids of contributing text blocks.
    pub source_blocks: Vec<usize>,
    pub origin: FieldOrigin,
    pub score: ConfidenceScore,
}

impl Field {
    /// Aggregate confidence.
    pub fn confidence(&self) -> f32 {
        self.score.overall()
    }

    pub fn template_field_index(&self) -> Option<usize> {
        match self.origin {
            FieldOrigin::Template { field_index, .. } => Some(field_index),
            _ => None,
        }
    }
}

/// A page-level degradation absorbed during processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// One engine failed or timed out on a page and was excluded from it.
    EngineUnavailable {
        page: usize,
        engine: String,
        reason: String,
    },
    /// Every engine failed on a page; the page produced no text blocks.
    AllEnginesFailed { page: usize, engines: Vec<String> },
    /// A template rule could not be evaluated.
    RuleSkipped {
        field: String,
        rule_id: String,
        reason: String,
    },
}

impl Degradation {
    pub fn page(&self) -> Option<usize> {
        match self {
            Self::EngineUnavailable { page, .. } | Self::AllEnginesFailed { page, .. } => {
                Some(*page)
            }
            Self::RuleSkipped { .. } => None,
        }
    }
}

/// Document-wide confidence summary.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DocumentConfidence {
    /// Mean of field `overall` scores, or of block confidences when no fields exist.
    pub overall: f32,
    pub average_block: f32,
    pub min_block: f32,
    pub max_block: f32,
    pub total_blocks: usize,
    pub low_confidence_fields: usize,
}

/// The finalized per-job record handed to collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub pages: Vec<PageGeometry>,
    pub text_blocks: Vec<TextBlock>,
    pub fields: Vec<Field>,
    pub validation: ValidationSummary,
    pub confidence: DocumentConfidence,
    pub degradations: Vec<Degradation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<TemplateId>,
    pub processing_time_ms: u64,
}

impl ExtractionResult {
    pub fn blocks_on_page(&self, page: usize) -> impl Iterator<Item = &TextBlock> {
        self.text_blocks.iter().filter(move |b| b.page == page)
    }

    pub fn degraded_pages(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self
            .degradations
            .iter()
            .filter(|d| matches!(d, Degradation::AllEnginesFailed { .. }))
            .filter_map(Degradation::page)
            .collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_uses_weights() {
        let w = ScoreWeights::default();
        let s = ConfidenceScore::new(0.8, 0.6, Some(0.5), &w);
        let expected = 0.5 * 0.8 + 0.3 * 0.6 + 0.2 * 0.5;
        assert!((s.overall() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_missing_validation_is_neutral() {
        let w = ScoreWeights::default();
        let without = ConfidenceScore::new(0.8, 0.6, None, &w);
        let neutral = ConfidenceScore::new(0.8, 0.6, Some(1.0), &w);
        assert_eq!(without.overall(), neutral.overall());
    }

    #[test]
    fn test_overall_clamped() {
        let w = ScoreWeights {
            ocr: 3.0,
            layout: 0.0,
            validation: 0.0,
        };
        let s = ConfidenceScore::new(1.7, -2.0, None, &w);
        assert!(s.overall() <= 1.0 && s.overall() >= 0.0);
    }

    #[test]
    fn test_recompute_idempotent() {
        let w = ScoreWeights::default();
        let s = ConfidenceScore::new(0.91, 0.42, Some(0.33), &w);
        assert_eq!(s.recompute(&w), s);
        assert_eq!(s.recompute(&w).recompute(&w), s);
    }

    #[test]
    fn test_with_validation_updates_overall() {
        let w = ScoreWeights::default();
        let s = ConfidenceScore::new(0.9, 0.9, None, &w);
        let failed = s.with_validation(0.0, &w);
        assert!(failed.overall() < s.overall());
        assert_eq!(failed.validation_confidence(), Some(0.0));
    }

    #[test]
    fn test_degraded_pages_sorted_and_unique() {
        let failed = |page: usize, engine: &str| Degradation::AllEnginesFailed {
            page,
            engines: vec![engine.to_string()],
        };
        let result = ExtractionResult {
            pages: Vec::new(),
            text_blocks: Vec::new(),
            fields: Vec::new(),
            validation: ValidationSummary::default(),
            confidence: DocumentConfidence::default(),
            degradations: vec![
                failed(4, "a"),
                Degradation::EngineUnavailable {
                    page: 0,
                    engine: "b".to_string(),
                    reason: "timeout".to_string(),
                },
                failed(1, "a"),
                failed(4, "b"),
            ],
            template_id: None,
            processing_time_ms: 0,
        };
        assert_eq!(result.degraded_pages(), vec![1, 4]);
    }

    #[test]
    fn test_field_type_parse() {
        assert_eq!(FieldType::from_str("Numeric"), Some(FieldType::Number));
        assert_eq!(FieldType::from_str("dropdown"), None);
    }
}
