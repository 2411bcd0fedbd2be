//! Learned or registered layout templates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::document::PageGeometry;
use super::extraction::FieldType;
use super::geometry::BoundingBox;

/// Rule id reported when a required field has no value.
pub const REQUIRED_RULE_ID: &str = "required";

/// Opaque template identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(String);

impl TemplateId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TemplateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hex digest over page geometry and stable field layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Built-in format checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatRule {
    Date,
    Number,
    Boolean,
    Email,
    Phone,
}

impl FormatRule {
    pub fn rule_id(&self) -> &'static str {
        match self {
            Self::Date => "format.date",
            Self::Number => "format.number",
            Self::Boolean => "format.boolean",
            Self::Email => "format.email",
            Self::Phone => "format.phone",
        }
    }

    /// The format implied by a field type, if any.
    pub fn for_field_type(field_type: FieldType) -> Option<Self> {
        match field_type {
            FieldType::Date => Some(Self::Date),
            FieldType::Number => Some(Self::Number),
            FieldType::Checkbox | FieldType::Radio => Some(Self::Boolean),
            FieldType::Email => Some(Self::Email),
            FieldType::Phone => Some(Self::Phone),
            FieldType::Text | FieldType::Signature => None,
        }
    }
}

/// Template-declared custom rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FieldRule {
    Format { format: FormatRule },
    Regex { pattern: String },
    Range { min: Option<f64>, max: Option<f64> },
    Length { min: Option<usize>, max: Option<usize> },
    OneOf { values: Vec<String> },
}

impl FieldRule {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Format { .. } => "format",
            Self::Regex { .. } => "regex",
            Self::Range { .. } => "range",
            Self::Length { .. } => "length",
            Self::OneOf { .. } => "one_of",
        }
    }

    /// Identifier of this rule at `position` in a field's rule list.
    pub fn rule_id(&self, position: usize) -> String {
        match self {
            Self::Format { format } => format.rule_id().to_string(),
            other => format!("{}.{}", other.kind(), position),
        }
    }
}

/// Expected field in a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateField {
    pub name: String,
    pub field_type: FieldType,
    pub page: usize,
    /// Expected value region in page fractions (0..1).
    pub region: BoundingBox,
    /// Expected label region in page fractions, when the field had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_region: Option<BoundingBox>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub rules: Vec<FieldRule>,
}

/// Where a template came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateSource {
    Learned { job_id: String, filename: String },
    Registered,
}

/// Immutable layout schema for a class of documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub fingerprint: Fingerprint,
    pub pages: Vec<PageGeometry>,
    pub fields: Vec<TemplateField>,
    pub source: TemplateSource,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied template definition, before fingerprinting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,
    pub pages: Vec<PageGeometry>,
    pub fields: Vec<TemplateField>,
}
