//! Multi-dimensional confidence scoring.
//!
//! Each field gets an OCR, a layout and (after validation) a validation
//! confidence. The aggregate is always derived through
//! [`ConfidenceScore`], so changing a component can never leave a stale
//! `overall`.

use crate::config::ScoringConfig;
use crate::models::{
    ConfidenceScore, DocumentConfidence, Field, FieldOrigin, TextBlock, ValidationSummary,
};

use super::detector::DetectedField;

pub struct ConfidenceScorer {
    config: ScoringConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// OCR dimension: mean confidence of the contributing blocks, the raster
    /// evidence for marks, or a low floor for fields without a value.
    fn ocr_confidence(&self, field: &DetectedField, blocks: &[TextBlock]) -> f32 {
        let confidences: Vec<f32> = field
            .source_blocks
            .iter()
            .filter_map(|id| blocks.get(*id).filter(|b| b.id == *id))
            .map(|b| b.ocr_confidence)
            .collect();
        if !confidences.is_empty() && !field.value.is_empty() {
            return confidences.iter().sum::<f32>() / confidences.len() as f32;
        }
        match field.raster_confidence {
            Some(c) => c,
            None => self.config.empty_value_ocr,
        }
    }

    /// Layout dimension from how the field was located.
    ///
    /// Template matches scale with region overlap; heuristic pairings lose
    /// confidence with every equally plausible alternative.
    pub fn layout_confidence(&self, origin: &FieldOrigin) -> f32 {
        match origin {
            FieldOrigin::Template { region_overlap, .. } => {
                self.config.template_layout * region_overlap.clamp(0.0, 1.0)
            }
            FieldOrigin::Heuristic { alternatives } => {
                self.config.heuristic_layout / (1.0 + *alternatives as f32)
            }
            FieldOrigin::Raster => self.config.raster_layout,
            FieldOrigin::Unpaired => self.config.unpaired_layout,
        }
    }

    /// Turn a detected field into a scored field. Validation is still pending.
    pub fn score_field(&self, field: DetectedField, blocks: &[TextBlock]) -> Field {
        let ocr = self.ocr_confidence(&field, blocks);
        let layout = self.layout_confidence(&field.origin);
        Field {
            name: field.name,
            field_type: field.field_type,
            value: field.value,
            page: field.page,
            bbox: field.bbox,
            label_bbox: field.label_bbox,
            source_blocks: field.source_blocks,
            origin: field.origin,
            score: ConfidenceScore::new(ocr, layout, None, &self.config.weights),
        }
    }

    /// Recompute every field's aggregate from its components.
    pub fn recompute(&self, fields: &mut [Field]) {
        for field in fields {
            field.score = field.score.recompute(&self.config.weights);
        }
    }

    /// Fold validation results into the fields' validation dimension.
    ///
    /// Fields without a result keep whatever they had.
    pub fn apply_validation(&self, fields: &mut [Field], summary: &ValidationSummary) {
        for (index, field) in fields.iter_mut().enumerate() {
            if let Some(result) = summary.for_field(index) {
                field.score = field
                    .score
                    .with_validation(result.pass_ratio(), &self.config.weights);
            }
        }
    }

    /// Document-wide confidence summary.
    pub fn document_summary(&self, blocks: &[TextBlock], fields: &[Field]) -> DocumentConfidence {
        if blocks.is_empty() && fields.is_empty() {
            return DocumentConfidence::default();
        }
        let block_confidences: Vec<f32> = blocks.iter().map(|b| b.ocr_confidence).collect();
        let (average_block, min_block, max_block) = if block_confidences.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                block_confidences.iter().sum::<f32>() / block_confidences.len() as f32,
                block_confidences.iter().copied().fold(f32::INFINITY, f32::min),
                block_confidences.iter().copied().fold(0.0, f32::max),
            )
        };
        let overall = if fields.is_empty() {
            average_block
        } else {
            fields.iter().map(Field::confidence).sum::<f32>() / fields.len() as f32
        };
        DocumentConfidence {
            overall,
            average_block,
            min_block,
            max_block,
            total_blocks: blocks.len(),
            low_confidence_fields: fields
                .iter()
                .filter(|f| f.confidence() < self.config.low_confidence_threshold)
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, FieldType, FieldValue, TemplateId, ValidationResult};

    fn block(id: usize, conf: f32) -> TextBlock {
        TextBlock {
            id,
            page: 0,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            text: "x".into(),
            ocr_confidence: conf,
            contributions: Vec::new(),
        }
    }

    fn detected(origin: FieldOrigin, value: &str, sources: Vec<usize>) -> DetectedField {
        DetectedField {
            name: "f".into(),
            field_type: FieldType::Text,
            value: FieldValue::Text(value.into()),
            page: 0,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            label_bbox: None,
            source_blocks: sources,
            origin,
            raster_confidence: None,
        }
    }

    #[test]
    fn test_template_beats_heuristic_layout() {
        let scorer = ConfidenceScorer::new(ScoringConfig::default());
        let template = scorer.layout_confidence(&FieldOrigin::Template {
            template_id: TemplateId::from("t"),
            field_index: 0,
            region_overlap: 1.0,
        });
        let heuristic = scorer.layout_confidence(&FieldOrigin::Heuristic { alternatives: 0 });
        let ambiguous = scorer.layout_confidence(&FieldOrigin::Heuristic { alternatives: 2 });
        assert!(template > heuristic);
        assert!(heuristic > ambiguous);
    }

    #[test]
    fn test_score_uses_block_confidence() {
        let scorer = ConfidenceScorer::new(ScoringConfig::default());
        let blocks = vec![block(0, 0.6), block(1, 0.8)];
        let field = scorer.score_field(
            detected(FieldOrigin::Heuristic { alternatives: 0 }, "v", vec![0, 1]),
            &blocks,
        );
        assert!((field.score.ocr_confidence() - 0.7).abs() < 1e-6);
        assert_eq!(field.score.validation_confidence(), None);
    }

    #[test]
    fn test_empty_value_scores_low() {
        let scorer = ConfidenceScorer::new(ScoringConfig::default());
        let empty = scorer.score_field(detected(FieldOrigin::Unpaired, "", vec![]), &[]);
        let blocks = vec![block(0, 0.9)];
        let full = scorer.score_field(
            detected(FieldOrigin::Heuristic { alternatives: 0 }, "v", vec![0]),
            &blocks,
        );
        assert!(empty.confidence() < full.confidence());
        assert!(empty.confidence() < 0.5);
    }

    #[test]
    fn test_apply_validation_and_recompute_idempotent() {
        let scorer = ConfidenceScorer::new(ScoringConfig::default());
        let blocks = vec![block(0, 0.9)];
        let mut fields = vec![scorer.score_field(
            detected(FieldOrigin::Heuristic { alternatives: 0 }, "v", vec![0]),
            &blocks,
        )];
        let before = fields[0].confidence();
        let summary = ValidationSummary::from_results(vec![ValidationResult {
            field_index: 0,
            field_name: "f".into(),
            passed: false,
            failed_rule: Some("format.date".into()),
            violations: vec![crate::models::RuleViolation {
                rule_id: "format.date".into(),
                message: "bad".into(),
            }],
            skipped_rules: Vec::new(),
            rules_checked: 1,
        }]);
        scorer.apply_validation(&mut fields, &summary);
        assert!(fields[0].confidence() < before);
        let snapshot = fields.clone();
        scorer.recompute(&mut fields);
        scorer.recompute(&mut fields);
        assert_eq!(fields, snapshot);
    }

    #[test]
    fn test_document_summary() {
        let scorer = ConfidenceScorer::new(ScoringConfig::default());
        let blocks = vec![block(0, 0.5), block(1, 1.0)];
        let summary = scorer.document_summary(&blocks, &[]);
        assert_eq!(summary.total_blocks, 2);
        assert!((summary.average_block - 0.75).abs() < 1e-6);
        assert_eq!(summary.min_block, 0.5);
        assert_eq!(summary.max_block, 1.0);
        assert_eq!(summary.overall, summary.average_block);
        assert_eq!(scorer.document_summary(&[], &[]), DocumentConfidence::default());
    }
}
