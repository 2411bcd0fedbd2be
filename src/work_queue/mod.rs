//! Per-job processing pipeline.
//!
//! A job runs an ordered list of [`PipelineStage`]s (OCR, detection,
//! scoring, validation). Each stage returns a [`StageOutcome`] and the
//! [`PipelineRunner`] folds them with [`reduce`]: degradations accumulate,
//! the first fatal outcome ends the job.

mod control;
mod pipeline;
mod runner;
mod stages;

pub use control::{CancelFlag, StageControl};
pub use pipeline::{JobContext, PipelineEvent, PipelineStage, StageOutcome, StageReporter};
pub use runner::{reduce, PipelineRunner, RunState};
pub use stages::{
    standard_pipeline, DetectionStage, OcrStage, ScoringStage, ValidationStage,
};
