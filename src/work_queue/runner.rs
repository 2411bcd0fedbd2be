//! Pipeline runner: drives a job's stages in order and folds their outcomes.
//!
//! The job-level transition is decided by [`reduce`], a pure fold over
//! stage outcomes. Degradations accumulate; the first fatal outcome wins and
//! stops the run.

use tokio::sync::mpsc;

use crate::models::{Degradation, JobError};

use super::control::StageControl;
use super::pipeline::{JobContext, PipelineEvent, PipelineStage, StageOutcome, StageReporter};

/// Accumulated state of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Running { degradations: Vec<Degradation> },
    Failed(JobError),
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running {
            degradations: Vec::new(),
        }
    }
}

impl RunState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn into_result(self) -> Result<Vec<Degradation>, JobError> {
        match self {
            Self::Running { degradations } => Ok(degradations),
            Self::Failed(error) => Err(error),
        }
    }
}

/// Fold one stage outcome into the run state. `Failed` is absorbing.
pub fn reduce(state: RunState, outcome: StageOutcome) -> RunState {
    match (state, outcome) {
        (RunState::Failed(error), _) => RunState::Failed(error),
        (RunState::Running { .. }, StageOutcome::Fatal(error)) => RunState::Failed(error),
        (RunState::Running { mut degradations }, StageOutcome::Completed { degradations: new }) => {
            degradations.extend(new);
            RunState::Running { degradations }
        }
    }
}

struct WeightedStage {
    stage: Box<dyn PipelineStage>,
    weight: u32,
}

/// Ordered list of weighted stages.
#[derive(Default)]
pub struct PipelineRunner {
    stages: Vec<WeightedStage>,
}

impl PipelineRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage; `weight` is its share of job progress.
    pub fn add_stage(&mut self, stage: Box<dyn PipelineStage>, weight: u32) {
        self.stages.push(WeightedStage { stage, weight });
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.stage.name()).collect()
    }

    fn total_weight(&self) -> u32 {
        self.stages.iter().map(|s| s.weight).sum()
    }

    /// Run every stage in order against `ctx`.
    ///
    /// Returns the collected degradations, or the job error of the first
    /// stage that could not complete. Control is checked before each stage
    /// and once more after the last one.
    pub async fn run(
        &self,
        ctx: &mut JobContext,
        control: &StageControl,
        events: &mpsc::Sender<PipelineEvent>,
    ) -> Result<Vec<Degradation>, JobError> {
        let total_weight = self.total_weight().max(1) as f32;
        let mut completed_weight = 0u32;
        let mut state = RunState::default();

        for entry in &self.stages {
            let stage = entry.stage.as_ref();
            let name = stage.name();

            let outcome = match control.check() {
                Err(error) => StageOutcome::Fatal(error),
                Ok(()) => {
                    let units = stage.units(ctx);
                    let _ = events
                        .send(PipelineEvent::StageStarted {
                            stage: name.to_string(),
                            units,
                        })
                        .await;
                    let reporter = StageReporter::new(
                        name,
                        events,
                        completed_weight as f32 / total_weight,
                        entry.weight as f32 / total_weight,
                    );
                    let outcome = stage.run(ctx, control, &reporter).await;
                    if matches!(outcome, StageOutcome::Completed { .. }) {
                        reporter.units_done(units, units).await;
                    }
                    outcome
                }
            };

            match &outcome {
                StageOutcome::Completed { degradations } => {
                    tracing::debug!(
                        job_id = %ctx.job_id,
                        stage = name,
                        degradations = degradations.len(),
                        "Stage completed"
                    );
                    let _ = events
                        .send(PipelineEvent::StageCompleted {
                            stage: name.to_string(),
                            degradations: degradations.len(),
                        })
                        .await;
                }
                StageOutcome::Fatal(error) => {
                    tracing::info!(job_id = %ctx.job_id, stage = name, "Stage failed: {}", error);
                    let _ = events
                        .send(PipelineEvent::StageFailed {
                            stage: name.to_string(),
                            error: error.clone(),
                        })
                        .await;
                }
            }

            state = reduce(state, outcome);
            if state.is_failed() {
                break;
            }
            completed_weight += entry.weight;
        }

        // A request that arrived during the last stage still wins.
        if !state.is_failed() {
            if let Err(error) = control.check() {
                state = reduce(state, StageOutcome::Fatal(error));
            }
        }

        state.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, DocumentKind, FailureKind, JobId, Page};
    use async_trait::async_trait;
    use image::GrayImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::work_queue::CancelFlag;

    fn degradation(page: usize) -> Degradation {
        Degradation::AllEnginesFailed {
            page,
            engines: vec!["a".into()],
        }
    }

    fn context() -> JobContext {
        JobContext::new(
            JobId::generate(),
            Document {
                kind: DocumentKind::Image,
                mime_type: "image/png".into(),
                pages: vec![Page::new(0, GrayImage::new(4, 4))],
            },
        )
    }

    struct Fixed {
        name: &'static str,
        outcome: StageOutcome,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PipelineStage for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn units(&self, _ctx: &JobContext) -> usize {
            1
        }

        async fn run(
            &self,
            _ctx: &mut JobContext,
            _control: &StageControl,
            _reporter: &StageReporter<'_>,
        ) -> StageOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    #[test]
    fn test_reduce_accumulates_degradations() {
        let state = reduce(
            RunState::default(),
            StageOutcome::Completed {
                degradations: vec![degradation(0)],
            },
        );
        let state = reduce(
            state,
            StageOutcome::Completed {
                degradations: vec![degradation(1)],
            },
        );
        assert_eq!(state.into_result().unwrap().len(), 2);
    }

    #[test]
    fn test_reduce_failure_is_absorbing() {
        let error = JobError::new(FailureKind::Cancelled, "stop");
        let state = reduce(RunState::default(), StageOutcome::Fatal(error.clone()));
        let state = reduce(state, StageOutcome::ok());
        let state = reduce(
            state,
            StageOutcome::Fatal(JobError::new(FailureKind::Timeout, "late")),
        );
        assert_eq!(state, RunState::Failed(error));
    }

    #[tokio::test]
    async fn test_run_stops_at_first_fatal_stage() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut runner = PipelineRunner::new();
        runner.add_stage(
            Box::new(Fixed {
                name: "one",
                outcome: StageOutcome::Fatal(JobError::new(FailureKind::Internal, "boom")),
                calls: first.clone(),
            }),
            50,
        );
        runner.add_stage(
            Box::new(Fixed {
                name: "two",
                outcome: StageOutcome::ok(),
                calls: second.clone(),
            }),
            50,
        );

        let (tx, mut rx) = mpsc::channel(64);
        let control = StageControl::new(CancelFlag::new(), Duration::from_secs(60));
        let mut ctx = context();
        let err = runner.run(&mut ctx, &control, &tx).await.unwrap_err();
        drop(tx);

        assert_eq!(err.kind, FailureKind::Internal);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        let mut saw_failure = false;
        while let Some(event) = rx.recv().await {
            if let PipelineEvent::StageFailed { stage, .. } = event {
                assert_eq!(stage, "one");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_run_progress_is_monotonic() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut runner = PipelineRunner::new();
        for (name, weight) in [("ocr", 40), ("detection", 25), ("scoring", 15), ("validation", 20)] {
            runner.add_stage(
                Box::new(Fixed {
                    name,
                    outcome: StageOutcome::ok(),
                    calls: calls.clone(),
                }),
                weight,
            );
        }

        let (tx, mut rx) = mpsc::channel(64);
        let control = StageControl::new(CancelFlag::new(), Duration::from_secs(60));
        let mut ctx = context();
        runner.run(&mut ctx, &control, &tx).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            if let PipelineEvent::Progress { percent, .. } = event {
                seen.push(percent);
            }
        }
        assert_eq!(seen, vec![40, 65, 80, 100]);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancelled_job_runs_no_stage() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut runner = PipelineRunner::new();
        runner.add_stage(
            Box::new(Fixed {
                name: "ocr",
                outcome: StageOutcome::ok(),
                calls: calls.clone(),
            }),
            1,
        );
        let flag = CancelFlag::new();
        flag.cancel();
        let control = StageControl::new(flag, Duration::from_secs(60));
        let (tx, _rx) = mpsc::channel(64);
        let mut ctx = context();
        let err = runner.run(&mut ctx, &control, &tx).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
