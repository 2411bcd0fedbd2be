//! Pipeline stage trait, per-job working state and stage outcomes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::analysis::DetectedField;
use crate::models::{
    Degradation, Document, DocumentConfidence, ExtractionResult, Field, JobError, JobId, Template,
    TextBlock, ValidationSummary,
};

use super::control::StageControl;

/// Events emitted while a job's pipeline runs.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted {
        stage: String,
        units: usize,
    },
    /// Job-wide progress in percent, derived from stage weights.
    Progress {
        stage: String,
        percent: u8,
    },
    StageCompleted {
        stage: String,
        degradations: usize,
    },
    StageFailed {
        stage: String,
        error: JobError,
    },
}

/// Tagged result of running one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The stage finished; anything it had to give up on is listed.
    Completed { degradations: Vec<Degradation> },
    /// The job cannot continue.
    Fatal(JobError),
}

impl StageOutcome {
    pub fn ok() -> Self {
        Self::Completed {
            degradations: Vec::new(),
        }
    }
}

/// Working state of one job while its stages run.
///
/// Owned by the job's worker; nothing here is visible to pollers until the
/// job completes and [`JobContext::into_result`] builds the final record.
pub struct JobContext {
    pub job_id: JobId,
    pub document: Document,
    pub blocks: Vec<TextBlock>,
    pub detected: Vec<DetectedField>,
    pub fields: Vec<Field>,
    pub validation: ValidationSummary,
    pub confidence: DocumentConfidence,
    pub template: Option<Arc<Template>>,
}

impl JobContext {
    pub fn new(job_id: JobId, document: Document) -> Self {
        Self {
            job_id,
            document,
            blocks: Vec::new(),
            detected: Vec::new(),
            fields: Vec::new(),
            validation: ValidationSummary::default(),
            confidence: DocumentConfidence::default(),
            template: None,
        }
    }

    pub fn into_result(
        self,
        degradations: Vec<Degradation>,
        processing_time_ms: u64,
    ) -> ExtractionResult {
        ExtractionResult {
            pages: self.document.geometry(),
            text_blocks: self.blocks,
            fields: self.fields,
            validation: self.validation,
            confidence: self.confidence,
            degradations,
            template_id: self.template.map(|t| t.id.clone()),
            processing_time_ms,
        }
    }
}

/// Reports unit-level progress inside a stage as job-wide percentages.
pub struct StageReporter<'a> {
    stage: &'a str,
    events: &'a mpsc::Sender<PipelineEvent>,
    /// Job progress (0.0-1.0) when the stage started.
    base: f32,
    /// Share of the job this stage covers.
    span: f32,
}

impl<'a> StageReporter<'a> {
    pub fn new(
        stage: &'a str,
        events: &'a mpsc::Sender<PipelineEvent>,
        base: f32,
        span: f32,
    ) -> Self {
        Self {
            stage,
            events,
            base,
            span,
        }
    }

    pub fn percent_for(&self, done: usize, total: usize) -> u8 {
        let fraction = if total == 0 {
            1.0
        } else {
            (done.min(total) as f32) / total as f32
        };
        ((self.base + self.span * fraction) * 100.0)
            .round()
            .clamp(0.0, 100.0) as u8
    }

    pub async fn units_done(&self, done: usize, total: usize) {
        let _ = self
            .events
            .send(PipelineEvent::Progress {
                stage: self.stage.to_string(),
                percent: self.percent_for(done, total),
            })
            .await;
    }
}

/// One step of document processing.
///
/// Stages run strictly in sequence for a job. A stage checks `control`
/// between its units of work (pages) and returns `Fatal` once the job has
/// been cancelled or has run out of time.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &str;

    /// Units of work the stage will report for this job.
    fn units(&self, ctx: &JobContext) -> usize;

    async fn run(
        &self,
        ctx: &mut JobContext,
        control: &StageControl,
        reporter: &StageReporter<'_>,
    ) -> StageOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_percent() {
        let (tx, _rx) = mpsc::channel(4);
        let reporter = StageReporter::new("ocr", &tx, 0.0, 0.4);
        assert_eq!(reporter.percent_for(0, 2), 0);
        assert_eq!(reporter.percent_for(1, 2), 20);
        assert_eq!(reporter.percent_for(2, 2), 40);
        assert_eq!(reporter.percent_for(5, 2), 40);
        assert_eq!(reporter.percent_for(0, 0), 40);
    }

    #[test]
    fn test_reporter_offset() {
        let (tx, _rx) = mpsc::channel(4);
        let reporter = StageReporter::new("scoring", &tx, 0.65, 0.15);
        assert_eq!(reporter.percent_for(1, 1), 80);
    }
}
