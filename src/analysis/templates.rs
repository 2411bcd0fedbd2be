//! Template fingerprinting, storage and learning.
//!
//! A template's fingerprint is a SHA-256 digest over its page geometry and
//! its field layout quantized to a coarse grid, so the same form learned
//! twice lands on the same fingerprint. The store is process-wide and
//! append-only: templates are immutable once stored.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::config::TemplateConfig;
use crate::models::{
    BoundingBox, ExtractionResult, Fingerprint, PageGeometry, Template, TemplateDefinition,
    TemplateField, TemplateId, TemplateSource, TextBlock,
};

/// Outcome of adding a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearnOutcome {
    Created(TemplateId),
    /// A template with the same fingerprint already exists.
    Duplicate(TemplateId),
}

impl LearnOutcome {
    pub fn template_id(&self) -> &TemplateId {
        match self {
            LearnOutcome::Created(id) | LearnOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, LearnOutcome::Duplicate(_))
    }
}

fn quantize(value: f32, grid: u32) -> u32 {
    (value.clamp(0.0, 1.0) * grid as f32).round() as u32
}

/// Digest page geometry and field layout into a fingerprint.
///
/// Only geometry that does not depend on the filled-in values is hashed:
/// label regions, field types and the anchor (left edge, top, height) of
/// each value region. Value extent follows the recognized text, so it is
/// left out, as are field names.
pub fn fingerprint(pages: &[PageGeometry], fields: &[TemplateField], grid: u32) -> Fingerprint {
    let grid = grid.max(1);
    let mut hasher = Sha256::new();
    hasher.update(format!("pages:{}\n", pages.len()));
    for page in pages {
        // Aspect ratio rather than pixels, so DPI does not matter.
        let aspect = page.width as f32 / page.height.max(1) as f32;
        hasher.update(format!("page:{}:{:.2}\n", page.index, aspect));
    }

    let mut entries: Vec<(usize, Option<[u32; 4]>, [u32; 3], &'static str)> = fields
        .iter()
        .map(|f| {
            let label = f.label_region.map(|r| {
                [
                    quantize(r.y, grid),
                    quantize(r.x, grid),
                    quantize(r.width, grid),
                    quantize(r.height, grid),
                ]
            });
            let anchor = [
                quantize(f.region.y, grid),
                quantize(f.region.x, grid),
                quantize(f.region.height, grid),
            ];
            (f.page, label, anchor, f.field_type.as_str())
        })
        .collect();
    entries.sort();
    for (page, label, anchor, field_type) in entries {
        let label = match label {
            Some([y, x, w, h]) => format!("{}:{}:{}:{}", y, x, w, h),
            None => "-".to_string(),
        };
        hasher.update(format!(
            "field:{}:{}:{}:{}:{}:{}\n",
            page, label, anchor[0], anchor[1], anchor[2], field_type
        ));
    }
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Process-wide template registry.
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: RwLock<HashMap<TemplateId, Arc<Template>>>,
    by_fingerprint: RwLock<HashMap<Fingerprint, TemplateId>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a template unless its fingerprint is already known.
    pub async fn insert(&self, template: Template) -> LearnOutcome {
        // Lock order: fingerprint index, then templates.
        let mut index = self.by_fingerprint.write().await;
        if let Some(existing) = index.get(&template.fingerprint) {
            return LearnOutcome::Duplicate(existing.clone());
        }
        let id = template.id.clone();
        index.insert(template.fingerprint.clone(), id.clone());
        self.templates
            .write()
            .await
            .insert(id.clone(), Arc::new(template));
        LearnOutcome::Created(id)
    }

    pub async fn get(&self, id: &TemplateId) -> Option<Arc<Template>> {
        self.templates.read().await.get(id).cloned()
    }

    /// All templates, oldest first.
    pub async fn list(&self) -> Vec<Arc<Template>> {
        let mut templates: Vec<Arc<Template>> =
            self.templates.read().await.values().cloned().collect();
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        templates
    }

    pub async fn len(&self) -> usize {
        self.templates.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.templates.read().await.is_empty()
    }

    /// Best template for a document, if any scores at least `threshold`.
    pub async fn find_match(
        &self,
        pages: &[PageGeometry],
        blocks: &[TextBlock],
        threshold: f32,
    ) -> Option<Arc<Template>> {
        let templates = self.list().await;
        templates
            .into_iter()
            .map(|t| {
                let score = match_score(&t, pages, blocks);
                (t, score)
            })
            .filter(|(_, score)| *score >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(t, score)| {
                tracing::debug!("Matched template {} ({:.2})", t.id, score);
                t
            })
    }
}

/// How well a document fits a template.
///
/// Zero unless page count and page shapes agree. Otherwise the share of
/// checkable template fields whose label region (or, for text fields
/// without one, value region) contains recognized text.
pub fn match_score(template: &Template, pages: &[PageGeometry], blocks: &[TextBlock]) -> f32 {
    if template.pages.len() != pages.len() {
        return 0.0;
    }
    let shapes_agree = template.pages.iter().zip(pages).all(|(a, b)| {
        let ra = a.width as f32 / a.height.max(1) as f32;
        let rb = b.width as f32 / b.height.max(1) as f32;
        (ra - rb).abs() <= 0.05 * ra.max(rb)
    });
    if !shapes_agree {
        return 0.0;
    }

    let mut considered = 0usize;
    let mut hits = 0usize;
    for field in &template.fields {
        let Some(page) = pages.get(field.page) else {
            continue;
        };
        let region = match (field.label_region, field.field_type.is_mark()) {
            (Some(label), _) => label,
            (None, false) => field.region,
            (None, true) => continue,
        };
        considered += 1;
        let region_px = region.denormalize(page.width, page.height);
        if blocks
            .iter()
            .filter(|b| b.page == field.page)
            .any(|b| b.bbox.coverage_by(&region_px) >= 0.3)
        {
            hits += 1;
        }
    }
    if considered == 0 {
        0.0
    } else {
        hits as f32 / considered as f32
    }
}

/// Builds templates from completed extractions.
pub struct TemplateLearner {
    config: TemplateConfig,
}

impl TemplateLearner {
    pub fn new(config: TemplateConfig) -> Self {
        Self { config }
    }

    /// Template fields from the stable subset of a result's fields.
    ///
    /// A field is stable when it is named and its confidence reaches the
    /// configured floor. Value regions are widened so that longer values on
    /// the next document of the same form still fall inside.
    pub fn stable_fields(&self, result: &ExtractionResult) -> Vec<TemplateField> {
        result
            .fields
            .iter()
            .filter(|f| !f.name.is_empty() && f.confidence() >= self.config.stable_confidence)
            .filter_map(|f| {
                let page = result.pages.iter().find(|p| p.index == f.page)?;
                let region = f.bbox.normalized(page.width, page.height);
                let region = if f.field_type.is_mark() {
                    region.inflate(0.005)
                } else {
                    widen(region)
                };
                Some(TemplateField {
                    name: f.name.clone(),
                    field_type: f.field_type,
                    page: f.page,
                    region,
                    label_region: f.label_bbox.map(|b| b.normalized(page.width, page.height)),
                    required: false,
                    rules: Vec::new(),
                })
            })
            .collect()
    }

    /// Build a template from a completed job's result.
    ///
    /// Returns `None` when no field is stable enough to anchor a layout.
    pub fn learn(
        &self,
        name: &str,
        result: &ExtractionResult,
        source: TemplateSource,
    ) -> Option<Template> {
        let fields = self.stable_fields(result);
        if fields.is_empty() {
            return None;
        }
        Some(self.build(name, result.pages.clone(), fields, source))
    }

    /// Build a template from a caller-supplied definition.
    pub fn from_definition(&self, definition: TemplateDefinition) -> Template {
        self.build(
            &definition.name,
            definition.pages,
            definition.fields,
            TemplateSource::Registered,
        )
    }

    fn build(
        &self,
        name: &str,
        pages: Vec<PageGeometry>,
        fields: Vec<TemplateField>,
        source: TemplateSource,
    ) -> Template {
        Template {
            id: TemplateId::generate(),
            name: name.to_string(),
            fingerprint: fingerprint(&pages, &fields, self.config.fingerprint_grid),
            pages,
            fields,
            source,
            created_at: Utc::now(),
        }
    }
}

/// Extend a normalized value region to the right and pad it vertically.
fn widen(region: BoundingBox) -> BoundingBox {
    let right = (region.right() + region.width * 0.5).min(1.0);
    let top = (region.y - region.height * 0.25).max(0.0);
    let bottom = (region.bottom() + region.height * 0.25).min(1.0);
    BoundingBox::from_coords(region.x, top, right, bottom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ConfidenceScore, DocumentConfidence, Field, FieldOrigin, FieldType, FieldValue,
        ScoreWeights, ValidationSummary,
    };

    fn page() -> PageGeometry {
        PageGeometry {
            index: 0,
            width: 1000,
            height: 1400,
        }
    }

    fn field(name: &str, x: f32, y: f32, conf: f32) -> Field {
        Field {
            name: name.into(),
            field_type: FieldType::Text,
            value: FieldValue::Text("v".into()),
            page: 0,
            bbox: BoundingBox::new(x, y, 200.0, 30.0),
            label_bbox: Some(BoundingBox::new(x - 150.0, y, 120.0, 30.0)),
            source_blocks: vec![0],
            origin: FieldOrigin::Heuristic { alternatives: 0 },
            score: ConfidenceScore::new(conf, conf, None, &ScoreWeights::default()),
        }
    }

    fn result(fields: Vec<Field>) -> ExtractionResult {
        ExtractionResult {
            pages: vec![page()],
            text_blocks: Vec::new(),
            fields,
            validation: ValidationSummary::default(),
            confidence: DocumentConfidence::default(),
            degradations: Vec::new(),
            template_id: None,
            processing_time_ms: 0,
        }
    }

    fn learner() -> TemplateLearner {
        TemplateLearner::new(TemplateConfig::default())
    }

    #[test]
    fn test_unstable_fields_excluded() {
        let r = result(vec![field("name", 300.0, 100.0, 0.9), field("noise", 300.0, 600.0, 0.2)]);
        let fields = learner().stable_fields(&r);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "name");
        assert!(fields[0].region.x < 0.31 && fields[0].region.right() <= 1.0);
    }

    #[test]
    fn test_fingerprint_ignores_small_jitter_and_names() {
        let a = learner()
            .learn("a", &result(vec![field("name", 300.0, 100.0, 0.9)]), TemplateSource::Registered)
            .unwrap();
        let b = learner()
            .learn("b", &result(vec![field("full_name", 301.0, 101.0, 0.95)]), TemplateSource::Registered)
            .unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.id, b.id);

        let c = learner()
            .learn("c", &result(vec![field("name", 300.0, 700.0, 0.9)]), TemplateSource::Registered)
            .unwrap();
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[tokio::test]
    async fn test_same_form_with_different_values_is_one_template() {
        let short = field("name", 300.0, 100.0, 0.9);
        let mut long = field("name", 300.0, 100.0, 0.9);
        long.bbox = BoundingBox::new(300.0, 100.0, 460.0, 30.0);
        long.value = FieldValue::Text("Bartholomew Montgomery".into());
        let mut narrow = field("email", 300.0, 200.0, 0.9);
        narrow.bbox = BoundingBox::new(300.0, 200.0, 60.0, 30.0);
        let mut wide = field("email", 300.0, 200.0, 0.9);
        wide.bbox = BoundingBox::new(300.0, 200.0, 260.0, 30.0);

        let a = learner()
            .learn("a", &result(vec![short, narrow]), TemplateSource::Registered)
            .unwrap();
        let b = learner()
            .learn("b", &result(vec![long, wide]), TemplateSource::Registered)
            .unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);

        let store = TemplateStore::new();
        let first = store.insert(a).await;
        let second = store.insert(b).await;
        assert_eq!(second, LearnOutcome::Duplicate(first.template_id().clone()));
        assert_eq!(store.len().await, 1);
    }

    #[test]
    fn test_nothing_stable_learns_nothing() {
        let r = result(vec![field("noise", 300.0, 600.0, 0.1)]);
        assert!(learner().learn("x", &r, TemplateSource::Registered).is_none());
    }

    #[tokio::test]
    async fn test_store_rejects_duplicate_fingerprint() {
        let store = TemplateStore::new();
        let r = result(vec![field("name", 300.0, 100.0, 0.9)]);
        let first = store
            .insert(learner().learn("a", &r, TemplateSource::Registered).unwrap())
            .await;
        let second = store
            .insert(learner().learn("a", &r, TemplateSource::Registered).unwrap())
            .await;
        assert!(matches!(first, LearnOutcome::Created(_)));
        assert_eq!(second, LearnOutcome::Duplicate(first.template_id().clone()));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_find_match_by_label_regions() {
        let store = TemplateStore::new();
        let template = learner()
            .learn("form", &result(vec![field("name", 300.0, 100.0, 0.9)]), TemplateSource::Registered)
            .unwrap();
        store.insert(template).await;

        let label = TextBlock {
            id: 0,
            page: 0,
            bbox: BoundingBox::new(150.0, 100.0, 120.0, 30.0),
            text: "Name:".into(),
            ocr_confidence: 0.9,
            contributions: Vec::new(),
        };
        assert!(store.find_match(&[page()], &[label.clone()], 0.6).await.is_some());
        assert!(store.find_match(&[page()], &[], 0.6).await.is_none());

        let landscape = PageGeometry {
            index: 0,
            width: 1400,
            height: 1000,
        };
        assert!(store.find_match(&[landscape], &[label], 0.6).await.is_none());
    }
}
