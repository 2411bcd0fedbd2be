//! Form field detection.
//!
//! Fields are found three ways:
//! - template regions, when the document matched a known layout;
//! - raster marks (checkboxes, radio buttons, signatures);
//! - label/value pairing over the reconciled text blocks.
//!
//! Template regions are searched first and consume what they match; only
//! the remaining blocks and marks fall back to the heuristics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::DetectionConfig;
use crate::models::{
    BoundingBox, FieldOrigin, FieldType, FieldValue, Page, Template, TemplateField, TextBlock,
};

use super::raster::{self, Mark, MarkShape, SignatureRegion};

/// How the detector should look for fields.
#[derive(Debug, Clone, Default)]
pub enum DetectionMode {
    /// Layout heuristics only.
    #[default]
    Generic,
    /// Search the template's expected regions first.
    Templated(Arc<Template>),
}

impl DetectionMode {
    pub fn template(&self) -> Option<&Arc<Template>> {
        match self {
            DetectionMode::Generic => None,
            DetectionMode::Templated(t) => Some(t),
        }
    }
}

/// A detected field before scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedField {
    pub name: String,
    pub field_type: FieldType,
    pub value: FieldValue,
    pub page: usize,
    pub bbox: BoundingBox,
    pub label_bbox: Option<BoundingBox>,
    pub source_blocks: Vec<usize>,
    pub origin: FieldOrigin,
    /// Strength of the raster evidence for mark fields.
    pub raster_confidence: Option<f32>,
}

impl DetectedField {
    pub fn template_index(&self) -> Option<usize> {
        match self.origin {
            FieldOrigin::Template { field_index, .. } => Some(field_index),
            _ => None,
        }
    }
}

struct Keyword {
    synonyms: &'static [&'static str],
    canonical: Option<&'static str>,
    field_type: FieldType,
}

/// Known label vocabulary, most specific first.
const KEYWORDS: &[Keyword] = &[
    Keyword {
        synonyms: &["email", "email address", "mail"],
        canonical: Some("email"),
        field_type: FieldType::Email,
    },
    Keyword {
        synonyms: &["phone", "phone number", "telephone", "tel", "mobile", "cell", "fax"],
        canonical: Some("phone"),
        field_type: FieldType::Phone,
    },
    Keyword {
        synonyms: &["date of birth", "dob", "birth date", "birthday"],
        canonical: Some("date_of_birth"),
        field_type: FieldType::Date,
    },
    Keyword {
        synonyms: &["date"],
        canonical: None,
        field_type: FieldType::Date,
    },
    Keyword {
        synonyms: &["signature", "signed", "sign here"],
        canonical: Some("signature"),
        field_type: FieldType::Signature,
    },
    Keyword {
        synonyms: &["total", "amount", "amount due", "subtotal", "balance", "price", "quantity", "qty"],
        canonical: None,
        field_type: FieldType::Number,
    },
    Keyword {
        synonyms: &["account", "account number", "account no", "iban"],
        canonical: Some("account_number"),
        field_type: FieldType::Text,
    },
    Keyword {
        synonyms: &["address", "street", "city", "state", "zip", "zip code", "postal code"],
        canonical: None,
        field_type: FieldType::Text,
    },
    Keyword {
        synonyms: &["name", "full name", "first name", "last name", "surname"],
        canonical: None,
        field_type: FieldType::Text,
    },
];

/// Lowercase, drop hyphens, turn other punctuation into spaces.
fn normalize_label(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| *c != '-')
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `First Name:` -> `first_name`.
pub fn slugify(text: &str) -> String {
    let slug = normalize_label(text).replace(' ', "_");
    if slug.is_empty() {
        "field".to_string()
    } else {
        slug
    }
}

/// Canonical field name and implied type for a label.
pub fn classify_label(label: &str) -> (String, FieldType) {
    let norm = normalize_label(label);
    for keyword in KEYWORDS {
        if keyword.synonyms.iter().any(|s| *s == norm) {
            let name = keyword.canonical.map(str::to_string).unwrap_or_else(|| slugify(label));
            return (name, keyword.field_type);
        }
    }
    let padded = format!(" {} ", norm);
    for keyword in KEYWORDS {
        if keyword
            .synonyms
            .iter()
            .any(|s| padded.contains(&format!(" {} ", s)))
        {
            return (slugify(label), keyword.field_type);
        }
    }
    (slugify(label), FieldType::Text)
}

fn is_keyword(label: &str) -> bool {
    let norm = normalize_label(label);
    KEYWORDS
        .iter()
        .any(|k| k.synonyms.iter().any(|s| *s == norm))
}

/// Detect form fields on one page.
pub struct FieldDetector {
    config: DetectionConfig,
}

/// Blocks, marks and signatures still available for assignment.
struct PageState<'a> {
    page: &'a Page,
    blocks: Vec<&'a TextBlock>,
    marks: Vec<Mark>,
    signatures: Vec<SignatureRegion>,
    consumed: HashSet<usize>,
    used_marks: Vec<bool>,
    used_signatures: Vec<bool>,
}

impl<'a> PageState<'a> {
    fn free_blocks(&self) -> impl Iterator<Item = &'a TextBlock> + '_ {
        self.blocks
            .iter()
            .copied()
            .filter(move |b| !self.consumed.contains(&b.id))
    }
}

impl FieldDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Detect fields on `page` from the document's text blocks.
    ///
    /// Every returned field has a type and a value; a label with nothing to
    /// pair gets an empty value and an `Unpaired` origin.
    pub fn detect(
        &self,
        page: &Page,
        blocks: &[TextBlock],
        mode: &DetectionMode,
    ) -> Vec<DetectedField> {
        let page_blocks: Vec<&TextBlock> = blocks.iter().filter(|b| b.page == page.index).collect();
        let text_boxes: Vec<BoundingBox> = page_blocks.iter().map(|b| b.bbox).collect();
        let marks = raster::find_marks(page, &text_boxes, &self.config);
        let signatures = raster::find_signature_regions(page, &text_boxes, &marks, &self.config);

        let mut state = PageState {
            page,
            blocks: page_blocks,
            used_marks: vec![false; marks.len()],
            used_signatures: vec![false; signatures.len()],
            marks,
            signatures,
            consumed: HashSet::new(),
        };

        let mut fields = Vec::new();
        if let DetectionMode::Templated(template) = mode {
            fields.extend(self.detect_templated(&mut state, template));
        }
        fields.extend(self.detect_marks(&mut state));
        fields.extend(self.detect_labelled(&mut state));
        fields.extend(self.remaining_signatures(&mut state));

        tracing::debug!(page = page.index, "Detected {} fields", fields.len());
        fields
    }

    fn detect_templated(&self, state: &mut PageState<'_>, template: &Template) -> Vec<DetectedField> {
        let (width, height) = (state.page.width, state.page.height);
        let min_overlap = self.config.template_region_min_overlap;
        let page_index = state.page.index;
        let mut fields = Vec::new();

        for (index, expected) in template
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.page == page_index)
        {
            let region = expected.region.denormalize(width, height);
            let label_region = expected.label_region.map(|r| r.denormalize(width, height));
            let origin = |overlap: f32| FieldOrigin::Template {
                template_id: template.id.clone(),
                field_index: index,
                region_overlap: overlap.clamp(0.0, 1.0),
            };

            let field = match expected.field_type {
                FieldType::Checkbox | FieldType::Radio => {
                    let best = best_in_region(
                        state.marks.iter().map(|m| m.bbox),
                        &state.used_marks,
                        &region,
                        min_overlap,
                    );
                    match best {
                        Some((i, overlap)) => {
                            state.used_marks[i] = true;
                            let mark = &state.marks[i];
                            DetectedField {
                                name: expected.name.clone(),
                                field_type: expected.field_type,
                                value: FieldValue::Flag(mark.filled),
                                page: state.page.index,
                                bbox: mark.bbox,
                                label_bbox: label_region,
                                source_blocks: Vec::new(),
                                origin: origin(overlap),
                                raster_confidence: Some(mark.clarity),
                            }
                        }
                        None => missing(expected, state.page.index, region, label_region, origin(0.0)),
                    }
                }
                FieldType::Signature => {
                    let best = best_in_region(
                        state.signatures.iter().map(|s| s.bbox),
                        &state.used_signatures,
                        &region,
                        min_overlap,
                    );
                    match best {
                        Some((i, overlap)) => {
                            state.used_signatures[i] = true;
                            let sig = &state.signatures[i];
                            DetectedField {
                                name: expected.name.clone(),
                                field_type: FieldType::Signature,
                                value: FieldValue::Flag(true),
                                page: state.page.index,
                                bbox: sig.bbox,
                                label_bbox: label_region,
                                source_blocks: Vec::new(),
                                origin: origin(overlap),
                                raster_confidence: Some(signature_confidence(sig, &self.config)),
                            }
                        }
                        None => missing(expected, state.page.index, region, label_region, origin(0.0)),
                    }
                }
                _ => {
                    let inside: Vec<(&TextBlock, f32)> = state
                        .free_blocks()
                        .map(|b| (b, b.bbox.coverage_by(&region)))
                        .filter(|(_, c)| *c >= min_overlap)
                        .collect();
                    if inside.is_empty() {
                        missing(expected, state.page.index, region, label_region, origin(0.0))
                    } else {
                        let overlap = inside.iter().map(|(_, c)| c).sum::<f32>() / inside.len() as f32;
                        let text = inside
                            .iter()
                            .map(|(b, _)| strip_label(b, label_region.as_ref()))
                            .filter(|t| !t.is_empty())
                            .collect::<Vec<_>>()
                            .join(" ");
                        let bbox = inside
                            .iter()
                            .skip(1)
                            .fold(inside[0].0.bbox, |acc, (b, _)| acc.union(&b.bbox));
                        let ids: Vec<usize> = inside.iter().map(|(b, _)| b.id).collect();
                        state.consumed.extend(ids.iter().copied());
                        DetectedField {
                            name: expected.name.clone(),
                            field_type: expected.field_type,
                            value: FieldValue::Text(text),
                            page: state.page.index,
                            bbox,
                            label_bbox: label_region,
                            source_blocks: ids,
                            origin: origin(overlap),
                            raster_confidence: None,
                        }
                    }
                }
            };
            fields.push(field);
        }

        // Label text of matched template fields is not a field of its own.
        let label_ids: Vec<usize> = template
            .fields
            .iter()
            .filter(|f| f.page == state.page.index)
            .filter_map(|f| f.label_region.map(|r| r.denormalize(width, height)))
            .flat_map(|region| {
                state
                    .free_blocks()
                    .filter(|b| b.bbox.coverage_by(&region) >= min_overlap)
                    .map(|b| b.id)
                    .collect::<Vec<_>>()
            })
            .collect();
        state.consumed.extend(label_ids);
        fields
    }

    /// Checkboxes and radio buttons, named after the text beside them.
    fn detect_marks(&self, state: &mut PageState<'_>) -> Vec<DetectedField> {
        let max_gap = self.config.max_pair_distance * state.page.width as f32;
        let mut fields = Vec::new();
        for i in 0..state.marks.len() {
            if state.used_marks[i] {
                continue;
            }
            state.used_marks[i] = true;
            let mark = state.marks[i].clone();
            let option_label = state
                .free_blocks()
                .filter(|b| mark.bbox.vertical_overlap_ratio(&b.bbox) >= 0.5)
                .map(|b| (b, mark.bbox.horizontal_gap(&b.bbox)))
                .filter(|(_, gap)| *gap >= -2.0 && *gap <= max_gap.min(mark.bbox.width * 4.0))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(b, _)| (b.id, b.bbox, b.text.clone()));

            let field_type = match mark.shape {
                MarkShape::Square => FieldType::Checkbox,
                MarkShape::Round => FieldType::Radio,
            };
            let (name, label_bbox) = match option_label {
                Some((id, bbox, text)) => {
                    state.consumed.insert(id);
                    (slugify(&text), Some(bbox))
                }
                None => (field_type.as_str().to_string(), None),
            };
            fields.push(DetectedField {
                name,
                field_type,
                value: FieldValue::Flag(mark.filled),
                page: state.page.index,
                bbox: mark.bbox,
                label_bbox,
                source_blocks: Vec::new(),
                origin: FieldOrigin::Raster,
                raster_confidence: Some(mark.clarity),
            });
        }
        fields
    }

    fn is_label(&self, text: &str) -> bool {
        let text = text.trim();
        let short = text.chars().count() <= self.config.max_label_chars
            && text.split_whitespace().count() <= self.config.max_label_words;
        short && (text.ends_with(':') || is_keyword(text))
    }

    /// Split `Name: Alice` into label and value when the prefix looks like a label.
    fn split_inline<'t>(&self, text: &'t str) -> Option<(&'t str, &'t str)> {
        let (prefix, rest) = text.split_once(':')?;
        let prefix = prefix.trim();
        let rest = rest.trim();
        if prefix.is_empty()
            || rest.is_empty()
            || rest.starts_with("//")
            || !prefix.chars().any(char::is_alphabetic)
            || prefix.chars().count() > self.config.max_label_chars
            || prefix.split_whitespace().count() > self.config.max_label_words
        {
            return None;
        }
        Some((prefix, rest))
    }

    /// Label/value pairing over the remaining text blocks.
    fn detect_labelled(&self, state: &mut PageState<'_>) -> Vec<DetectedField> {
        let mut fields = Vec::new();
        let mut labels: Vec<&TextBlock> = Vec::new();

        let free: Vec<&TextBlock> = state.free_blocks().collect();
        for block in free {
            if self.is_label(&block.text) {
                labels.push(block);
            } else if let Some((prefix, rest)) = self.split_inline(&block.text) {
                state.consumed.insert(block.id);
                let (name, field_type) = classify_label(prefix);
                let total = block.text.chars().count().max(1) as f32;
                let label_chars = block
                    .text
                    .find(':')
                    .map(|i| block.text[..=i].chars().count())
                    .unwrap_or(0);
                let label_width = block.bbox.width * (label_chars as f32 / total);
                let label_bbox =
                    BoundingBox::new(block.bbox.x, block.bbox.y, label_width, block.bbox.height);
                let value_bbox = BoundingBox::new(
                    block.bbox.x + label_width,
                    block.bbox.y,
                    block.bbox.width - label_width,
                    block.bbox.height,
                );
                let value = if field_type.is_mark() {
                    FieldValue::Flag(!rest.is_empty())
                } else {
                    FieldValue::Text(rest.to_string())
                };
                fields.push(DetectedField {
                    name,
                    field_type,
                    value,
                    page: state.page.index,
                    bbox: value_bbox,
                    label_bbox: Some(label_bbox),
                    source_blocks: vec![block.id],
                    origin: FieldOrigin::Heuristic { alternatives: 0 },
                    raster_confidence: None,
                });
            }
        }

        for label in &labels {
            state.consumed.insert(label.id);
        }

        for label in labels {
            let (name, field_type) = classify_label(&label.text);
            if field_type == FieldType::Signature {
                fields.push(self.pair_signature(state, label, name));
                continue;
            }
            match self.pair_value(state, label) {
                Some((value, alternatives)) => {
                    state.consumed.insert(value.id);
                    fields.push(DetectedField {
                        name,
                        field_type,
                        value: FieldValue::Text(value.text.clone()),
                        page: state.page.index,
                        bbox: value.bbox,
                        label_bbox: Some(label.bbox),
                        source_blocks: vec![value.id],
                        origin: FieldOrigin::Heuristic { alternatives },
                        raster_confidence: None,
                    });
                }
                None => fields.push(DetectedField {
                    name,
                    field_type,
                    value: FieldValue::empty(),
                    page: state.page.index,
                    bbox: label.bbox,
                    label_bbox: Some(label.bbox),
                    source_blocks: Vec::new(),
                    origin: FieldOrigin::Unpaired,
                    raster_confidence: None,
                }),
            }
        }
        fields
    }

    /// Nearest free block to the right of `label`, else below it.
    ///
    /// Returns the chosen block and the number of other candidates within
    /// the ambiguity tolerance of the best distance.
    fn pair_value<'a>(&self, state: &PageState<'a>, label: &TextBlock) -> Option<(&'a TextBlock, usize)> {
        let max_right = self.config.max_pair_distance * state.page.width as f32;
        let max_below = label.bbox.height.max(1.0) * 3.0;

        let right: Vec<(&'a TextBlock, f32)> = state
            .blocks
            .iter()
            .copied()
            .filter(|b| !state.consumed.contains(&b.id))
            .filter(|b| label.bbox.vertical_overlap_ratio(&b.bbox) >= 0.5)
            .map(|b| (b, label.bbox.horizontal_gap(&b.bbox)))
            .filter(|(_, gap)| *gap >= -2.0 && *gap <= max_right)
            .map(|(b, gap)| (b, gap.max(0.0)))
            .collect();

        let candidates = if right.is_empty() {
            state
                .blocks
                .iter()
                .copied()
                .filter(|b| !state.consumed.contains(&b.id))
                .filter(|b| {
                    label.bbox.horizontal_overlap_ratio(&b.bbox) > 0.0
                        || (b.bbox.x - label.bbox.x).abs() <= label.bbox.height * 2.0
                })
                .map(|b| (b, label.bbox.vertical_gap(&b.bbox)))
                .filter(|(_, gap)| *gap >= -2.0 && *gap <= max_below)
                .map(|(b, gap)| (b, gap.max(0.0)))
                .collect()
        } else {
            right
        };

        let (best, best_distance) = candidates
            .iter()
            .copied()
            .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)))?;
        let tolerance = self.config.ambiguity_tolerance * best_distance.max(label.bbox.height);
        let alternatives = candidates
            .iter()
            .filter(|(b, d)| b.id != best.id && *d <= best_distance + tolerance)
            .count();
        Some((best, alternatives))
    }

    fn pair_signature(&self, state: &mut PageState<'_>, label: &TextBlock, name: String) -> DetectedField {
        let max_right = self.config.max_pair_distance * state.page.width as f32;
        let max_below = label.bbox.height.max(1.0) * 6.0;
        let best = state
            .signatures
            .iter()
            .enumerate()
            .filter(|(i, _)| !state.used_signatures[*i])
            .filter_map(|(i, sig)| {
                let right = label.bbox.vertical_overlap_ratio(&sig.bbox) > 0.0
                    && label.bbox.horizontal_gap(&sig.bbox) >= -2.0;
                let below = label.bbox.vertical_gap(&sig.bbox) >= -2.0;
                if right && label.bbox.horizontal_gap(&sig.bbox) <= max_right {
                    Some((i, label.bbox.horizontal_gap(&sig.bbox).max(0.0)))
                } else if below && label.bbox.vertical_gap(&sig.bbox) <= max_below {
                    Some((i, label.bbox.vertical_gap(&sig.bbox).max(0.0)))
                } else {
                    None
                }
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((i, _)) => {
                state.used_signatures[i] = true;
                let sig = &state.signatures[i];
                DetectedField {
                    name,
                    field_type: FieldType::Signature,
                    value: FieldValue::Flag(true),
                    page: state.page.index,
                    bbox: sig.bbox,
                    label_bbox: Some(label.bbox),
                    source_blocks: Vec::new(),
                    origin: FieldOrigin::Raster,
                    raster_confidence: Some(signature_confidence(sig, &self.config)),
                }
            }
            None => DetectedField {
                name,
                field_type: FieldType::Signature,
                value: FieldValue::Flag(false),
                page: state.page.index,
                bbox: label.bbox,
                label_bbox: Some(label.bbox),
                source_blocks: Vec::new(),
                origin: FieldOrigin::Unpaired,
                raster_confidence: None,
            },
        }
    }

    fn remaining_signatures(&self, state: &mut PageState<'_>) -> Vec<DetectedField> {
        let mut fields = Vec::new();
        for (i, sig) in state.signatures.iter().enumerate() {
            if state.used_signatures[i] {
                continue;
            }
            fields.push(DetectedField {
                name: "signature".to_string(),
                field_type: FieldType::Signature,
                value: FieldValue::Flag(true),
                page: state.page.index,
                bbox: sig.bbox,
                label_bbox: None,
                source_blocks: Vec::new(),
                origin: FieldOrigin::Raster,
                raster_confidence: Some(signature_confidence(sig, &self.config)),
            });
        }
        state.used_signatures.iter_mut().for_each(|u| *u = true);
        fields
    }
}

/// Index and coverage of the unused box best covered by `region`.
fn best_in_region(
    boxes: impl Iterator<Item = BoundingBox>,
    used: &[bool],
    region: &BoundingBox,
    min_overlap: f32,
) -> Option<(usize, f32)> {
    boxes
        .enumerate()
        .filter(|(i, _)| !used.get(*i).copied().unwrap_or(true))
        .map(|(i, b)| (i, b.coverage_by(region)))
        .filter(|(_, c)| *c >= min_overlap)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Text of a value block, minus a `Label:` prefix that spills into the label region.
fn strip_label(block: &TextBlock, label_region: Option<&BoundingBox>) -> String {
    let touches_label = label_region.is_some_and(|r| block.bbox.intersection_area(r) > 0.0);
    match block.text.split_once(':') {
        Some((_, rest)) if touches_label => rest.trim().to_string(),
        _ => block.text.trim().to_string(),
    }
}

fn missing(
    expected: &TemplateField,
    page: usize,
    region: BoundingBox,
    label_bbox: Option<BoundingBox>,
    origin: FieldOrigin,
) -> DetectedField {
    let value = if expected.field_type.is_mark() {
        FieldValue::Flag(false)
    } else {
        FieldValue::empty()
    };
    DetectedField {
        name: expected.name.clone(),
        field_type: expected.field_type,
        value,
        page,
        bbox: region,
        label_bbox,
        source_blocks: Vec::new(),
        origin,
        raster_confidence: None,
    }
}

/// Densities near the middle of the handwriting range score highest.
fn signature_confidence(sig: &SignatureRegion, config: &DetectionConfig) -> f32 {
    let mid = (config.signature_min_density + config.signature_max_density) / 2.0;
    let half = ((config.signature_max_density - config.signature_min_density) / 2.0).max(f32::EPSILON);
    let offset = ((sig.density - mid).abs() / half).min(1.0);
    1.0 - 0.5 * offset
}

/// Suffix repeated names across a whole document: `total`, `total_2`,
/// `total_3`. A suffix never collides with a name already present.
pub fn dedupe_names(fields: &mut [DetectedField]) {
    let mut taken: HashSet<String> = fields.iter().map(|f| f.name.clone()).collect();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for field in fields.iter_mut() {
        let count = seen.entry(field.name.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            continue;
        }
        let mut suffix = *count;
        let mut candidate = format!("{}_{}", field.name, suffix);
        while taken.contains(&candidate) {
            suffix += 1;
            candidate = format!("{}_{}", field.name, suffix);
        }
        *count = suffix;
        taken.insert(candidate.clone());
        field.name = candidate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fingerprint, PageGeometry, TemplateId, TemplateSource};
    use image::{GrayImage, Luma};

    fn block(id: usize, x: f32, y: f32, w: f32, text: &str) -> TextBlock {
        TextBlock {
            id,
            page: 0,
            bbox: BoundingBox::new(x, y, w, 20.0),
            text: text.to_string(),
            ocr_confidence: 0.9,
            contributions: Vec::new(),
        }
    }

    fn blank_page() -> Page {
        Page::new(0, GrayImage::from_pixel(1000, 800, Luma([255])))
    }

    fn detector() -> FieldDetector {
        FieldDetector::new(DetectionConfig::default())
    }

    #[test]
    fn test_classify_label() {
        assert_eq!(classify_label("E-mail:"), ("email".to_string(), FieldType::Email));
        assert_eq!(classify_label("Tel"), ("phone".to_string(), FieldType::Phone));
        assert_eq!(classify_label("Invoice Date:"), ("invoice_date".to_string(), FieldType::Date));
        assert_eq!(classify_label("Amount Due:"), ("amount_due".to_string(), FieldType::Number));
        assert_eq!(classify_label("IBAN"), ("account_number".to_string(), FieldType::Text));
        assert_eq!(classify_label("Reference:"), ("reference".to_string(), FieldType::Text));
    }

    #[test]
    fn test_pairs_label_with_value_to_the_right() {
        let blocks = vec![
            block(0, 50.0, 100.0, 80.0, "Name:"),
            block(1, 150.0, 100.0, 120.0, "Alice Smith"),
            block(2, 50.0, 140.0, 80.0, "Email:"),
            block(3, 150.0, 141.0, 200.0, "alice@example.com"),
        ];
        let fields = detector().detect(&blank_page(), &blocks, &DetectionMode::Generic);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "name");
        assert_eq!(fields[0].value, FieldValue::Text("Alice Smith".into()));
        assert_eq!(fields[0].source_blocks, vec![1]);
        assert_eq!(fields[1].field_type, FieldType::Email);
        assert_eq!(fields[1].origin, FieldOrigin::Heuristic { alternatives: 0 });
    }

    #[test]
    fn test_pairs_below_when_nothing_right() {
        let blocks = vec![
            block(0, 50.0, 100.0, 120.0, "Address:"),
            block(1, 50.0, 125.0, 300.0, "1 Main Street"),
        ];
        let fields = detector().detect(&blank_page(), &blocks, &DetectionMode::Generic);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].value.as_text(), "1 Main Street");
    }

    #[test]
    fn test_inline_label_value() {
        let blocks = vec![block(0, 50.0, 100.0, 300.0, "Phone: +1 555 0100")];
        let fields = detector().detect(&blank_page(), &blocks, &DetectionMode::Generic);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "phone");
        assert_eq!(fields[0].field_type, FieldType::Phone);
        assert_eq!(fields[0].value.as_text(), "+1 555 0100");
        assert!(fields[0].bbox.x > 50.0);
    }

    #[test]
    fn test_unpaired_label_kept_empty() {
        let blocks = vec![block(0, 50.0, 100.0, 80.0, "Date:")];
        let fields = detector().detect(&blank_page(), &blocks, &DetectionMode::Generic);
        assert_eq!(fields.len(), 1);
        assert!(fields[0].value.is_empty());
        assert_eq!(fields[0].origin, FieldOrigin::Unpaired);
        assert_eq!(fields[0].field_type, FieldType::Date);
    }

    #[test]
    fn test_ambiguous_pairing_counts_alternatives() {
        let blocks = vec![
            block(0, 200.0, 100.0, 80.0, "Total:"),
            block(1, 100.0, 125.0, 150.0, "12.00"),
            block(2, 210.0, 125.0, 150.0, "13.00"),
        ];
        let fields = detector().detect(&blank_page(), &blocks, &DetectionMode::Generic);
        let total = fields.iter().find(|f| f.name == "total").unwrap();
        assert_eq!(total.origin, FieldOrigin::Heuristic { alternatives: 1 });
    }

    #[test]
    fn test_checkbox_named_by_option_text() {
        let mut img = GrayImage::from_pixel(1000, 800, Luma([255]));
        for dy in 0..20u32 {
            for dx in 0..20u32 {
                let border = dx < 2 || dy < 2 || dx >= 18 || dy >= 18;
                let inside = (5..15).contains(&dx) && (5..15).contains(&dy);
                if border || inside {
                    img.put_pixel(100 + dx, 300 + dy, Luma([0]));
                }
            }
        }
        let page = Page::new(0, img);
        let blocks = vec![block(0, 130.0, 300.0, 150.0, "Subscribe")];
        let fields = detector().detect(&page, &blocks, &DetectionMode::Generic);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "subscribe");
        assert_eq!(fields[0].field_type, FieldType::Checkbox);
        assert_eq!(fields[0].value, FieldValue::Flag(true));
        assert_eq!(fields[0].origin, FieldOrigin::Raster);
    }

    #[test]
    fn test_templated_mode_uses_regions_first() {
        let template = Template {
            id: TemplateId::from("tpl"),
            name: "invoice".into(),
            fingerprint: Fingerprint("abc".into()),
            pages: vec![PageGeometry {
                index: 0,
                width: 1000,
                height: 800,
            }],
            fields: vec![TemplateField {
                name: "invoice_number".into(),
                field_type: FieldType::Text,
                page: 0,
                region: BoundingBox::new(0.5, 0.1, 0.3, 0.05),
                label_region: Some(BoundingBox::new(0.3, 0.1, 0.15, 0.05)),
                required: true,
                rules: Vec::new(),
            }],
            source: TemplateSource::Registered,
            created_at: chrono::Utc::now(),
        };
        let blocks = vec![
            block(0, 300.0, 85.0, 100.0, "Invoice No:"),
            block(1, 510.0, 85.0, 120.0, "INV-0042"),
            block(2, 50.0, 400.0, 80.0, "Notes:"),
            block(3, 150.0, 400.0, 200.0, "deliver by friday"),
        ];
        let mode = DetectionMode::Templated(Arc::new(template));
        let fields = detector().detect(&blank_page(), &blocks, &mode);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "invoice_number");
        assert_eq!(fields[0].value.as_text(), "INV-0042");
        assert_eq!(fields[0].template_index(), Some(0));
        assert_eq!(fields[1].name, "notes");
        assert!(matches!(fields[1].origin, FieldOrigin::Heuristic { .. }));
    }

    #[test]
    fn test_dedupe_names() {
        let blocks = vec![
            block(0, 50.0, 100.0, 80.0, "Total:"),
            block(1, 150.0, 100.0, 80.0, "1.00"),
            block(2, 50.0, 200.0, 80.0, "Total:"),
            block(3, 150.0, 200.0, 80.0, "2.00"),
        ];
        let mut fields = detector().detect(&blank_page(), &blocks, &DetectionMode::Generic);
        dedupe_names(&mut fields);
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["total", "total_2"]);
    }

    #[test]
    fn test_dedupe_names_skips_existing_suffix() {
        let blocks = vec![
            block(0, 50.0, 100.0, 80.0, "Total:"),
            block(1, 150.0, 100.0, 80.0, "1.00"),
            block(2, 50.0, 200.0, 80.0, "Total 2:"),
            block(3, 150.0, 200.0, 80.0, "2.00"),
            block(4, 50.0, 300.0, 80.0, "Total:"),
            block(5, 150.0, 300.0, 80.0, "3.00"),
        ];
        let mut fields = detector().detect(&blank_page(), &blocks, &DetectionMode::Generic);
        dedupe_names(&mut fields);
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["total", "total_2", "total_3"]);
    }
}
