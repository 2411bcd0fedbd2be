//! Processing jobs and their lifecycle state machine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::extraction::ExtractionResult;

/// Opaque job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The document could not be decoded.
    InvalidInput,
    /// The per-job processing deadline passed.
    Timeout,
    /// A caller asked for the job to stop.
    Cancelled,
    /// Unexpected internal error.
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// Terminal job error with a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Rejected state-machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One document's processing request and its lifecycle state.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub original_filename: String,
    pub created_at: DateTime<Utc>,
    status: JobStatus,
    progress: u8,
    error: Option<JobError>,
    result: Option<Arc<ExtractionResult>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, original_filename: impl Into<String>) -> Self {
        Self {
            id,
            original_filename: original_filename.into(),
            created_at: Utc::now(),
            status: JobStatus::Queued,
            progress: 0,
            error: None,
            result: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn result(&self) -> Option<&Arc<ExtractionResult>> {
        self.result.as_ref()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// `queued -> processing`.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.require(JobStatus::Queued, JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Raise progress. Lower values are ignored so progress never decreases.
    pub fn advance(&mut self, progress: u8) -> Result<(), TransitionError> {
        self.require(JobStatus::Processing, JobStatus::Processing)?;
        self.progress = self.progress.max(progress.min(100));
        Ok(())
    }

    /// `processing -> completed`.
    pub fn complete(&mut self, result: ExtractionResult) -> Result<(), TransitionError> {
        self.require(JobStatus::Processing, JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = Some(Arc::new(result));
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `queued | processing -> failed`. Progress is left where it was.
    pub fn fail(&mut self, error: JobError) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                from: self.status,
                to: JobStatus::Failed,
            });
        }
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn require(&self, expected: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            status: self.status,
            progress: self.progress,
            original_filename: self.original_filename.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Consistent point-in-time view of a job, returned to pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub original_filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentConfidence, ValidationSummary};

    fn empty_result() -> ExtractionResult {
        ExtractionResult {
            pages: Vec::new(),
            text_blocks: Vec::new(),
            fields: Vec::new(),
            validation: ValidationSummary::default(),
            confidence: DocumentConfidence::default(),
            degradations: Vec::new(),
            template_id: None,
            processing_time_ms: 0,
        }
    }

    #[test]
    fn test_happy_path() {
        let mut job = Job::new(JobId::generate(), "form.png");
        assert_eq!(job.status(), JobStatus::Queued);
        job.start().unwrap();
        job.advance(40).unwrap();
        job.complete(empty_result()).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100);
        assert!(job.result().is_some());
        assert!(job.error().is_none());
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut job = Job::new(JobId::generate(), "form.png");
        job.start().unwrap();
        job.advance(65).unwrap();
        job.advance(40).unwrap();
        assert_eq!(job.progress(), 65);
    }

    #[test]
    fn test_fail_from_queued_keeps_progress() {
        let mut job = Job::new(JobId::generate(), "junk.bin");
        job.fail(JobError::new(FailureKind::InvalidInput, "unreadable"))
            .unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.progress(), 0);
        assert_eq!(job.error().unwrap().kind, FailureKind::InvalidInput);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = Job::new(JobId::generate(), "form.png");
        job.start().unwrap();
        job.fail(JobError::new(FailureKind::Cancelled, "stop")).unwrap();
        assert!(job.complete(empty_result()).is_err());
        assert!(job.fail(JobError::new(FailureKind::Timeout, "late")).is_err());
        assert!(job.start().is_err());
        assert_eq!(job.error().unwrap().kind, FailureKind::Cancelled);
    }

    #[test]
    fn test_cannot_complete_from_queued() {
        let mut job = Job::new(JobId::generate(), "form.png");
        let err = job.complete(empty_result()).unwrap_err();
        assert_eq!(err.from, JobStatus::Queued);
    }
}
