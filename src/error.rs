//! Errors returned to callers of the orchestrator.

use thiserror::Error;

use crate::models::{JobId, JobStatus, TemplateId};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id} is not ready (status: {status})")]
    NotReady { id: JobId, status: JobStatus },

    #[error("Template not found: {0}")]
    TemplateNotFound(TemplateId),

    #[error("Job {0} has no fields stable enough to learn a template from")]
    NothingToLearn(JobId),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Unknown export format: {0}")]
    InvalidFormat(String),

    #[error("Export failed: {0}")]
    Export(String),
}

impl From<serde_json::Error> for ExtractError {
    fn from(e: serde_json::Error) -> Self {
        ExtractError::Export(e.to_string())
    }
}
