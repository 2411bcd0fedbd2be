//! Data models for docsift.

mod document;
mod extraction;
mod geometry;
mod job;
mod template;
mod validation;

pub use document::{Document, DocumentKind, Page, PageGeometry};
pub use extraction::{
    ConfidenceScore, Degradation, DocumentConfidence, EngineContribution, ExtractionResult,
    Field, FieldOrigin, FieldType, FieldValue, ScoreWeights, TextBlock,
};
pub use geometry::BoundingBox;
pub use job::{FailureKind, Job, JobError, JobId, JobSnapshot, JobStatus, TransitionError};
pub use template::{
    FieldRule, Fingerprint, FormatRule, Template, TemplateDefinition, TemplateField, TemplateId,
    TemplateSource, REQUIRED_RULE_ID,
};
pub use validation::{RuleViolation, SkippedRule, ValidationResult, ValidationSummary};
