//! Job orchestrator: accepts documents, runs them through the pipeline on a
//! bounded worker pool and answers status, result and template requests.
//!
//! `submit` never blocks on processing. Each job gets one spawned worker
//! that waits for a pool slot, decodes the document, then runs the stages.
//! Pollers only ever see complete transitions through the [`JobStore`].

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::analysis::{LearnOutcome, TemplateLearner, TemplateStore};
use crate::config::Settings;
use crate::error::ExtractError;
use crate::export::{self, ExportFormat};
use crate::models::{
    Document, ExtractionResult, FailureKind, Job, JobError, JobId, JobSnapshot, JobStatus,
    Template, TemplateDefinition, TemplateId, TemplateSource,
};
use crate::ocr::{build_engines, load_document, LoadError, LoadOptions, OcrEngine, OcrEnsemble};
use crate::work_queue::{
    standard_pipeline, CancelFlag, JobContext, PipelineEvent, PipelineRunner, StageControl,
};

use super::store::JobStore;

/// Availability of one configured engine.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub name: String,
    pub available: bool,
    pub hint: String,
}

enum JobInput {
    Bytes(Vec<u8>),
    Decoded(Document),
}

struct Inner {
    settings: Settings,
    jobs: JobStore,
    templates: Arc<TemplateStore>,
    ensemble: Arc<OcrEnsemble>,
    pipeline: PipelineRunner,
    learner: TemplateLearner,
    slots: Arc<Semaphore>,
}

/// Entry point for collaborators. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Orchestrator with the engines named in `settings`.
    pub fn new(settings: Settings) -> Self {
        let engines = build_engines(&settings.ocr);
        Self::with_engines(settings, engines)
    }

    /// Orchestrator with caller-supplied engines.
    pub fn with_engines(settings: Settings, engines: Vec<Arc<dyn OcrEngine>>) -> Self {
        let ensemble = Arc::new(OcrEnsemble::from_config(engines, &settings.ocr));
        let templates = Arc::new(TemplateStore::new());
        let pipeline = standard_pipeline(ensemble.clone(), templates.clone(), &settings);
        let slots = Arc::new(Semaphore::new(settings.pipeline.max_concurrent_jobs.max(1)));
        tracing::debug!(
            "Orchestrator ready: {} engine(s), {} worker slot(s), policy {}",
            ensemble.members().len(),
            settings.pipeline.max_concurrent_jobs,
            ensemble.policy_name()
        );
        Self {
            inner: Arc::new(Inner {
                learner: TemplateLearner::new(settings.templates.clone()),
                settings,
                jobs: JobStore::new(),
                templates,
                ensemble,
                pipeline,
                slots,
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Queue raw document bytes for processing.
    pub async fn submit(&self, bytes: Vec<u8>, filename: &str) -> JobId {
        self.enqueue(JobInput::Bytes(bytes), filename).await
    }

    /// Queue an already decoded document.
    pub async fn submit_document(&self, document: Document, filename: &str) -> JobId {
        self.enqueue(JobInput::Decoded(document), filename).await
    }

    async fn enqueue(&self, input: JobInput, filename: &str) -> JobId {
        let cancel = CancelFlag::new();
        let mut id = JobId::generate();
        while !self
            .inner
            .jobs
            .insert(Job::new(id, filename), cancel.clone())
            .await
        {
            id = JobId::generate();
        }
        tracing::info!(job_id = %id, "Queued {}", filename);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.process(id, input, cancel).await });
        id
    }

    pub async fn status(&self, id: &JobId) -> Result<JobSnapshot, ExtractError> {
        self.inner
            .jobs
            .snapshot(id)
            .await
            .ok_or(ExtractError::NotFound(*id))
    }

    pub async fn result(&self, id: &JobId) -> Result<Arc<ExtractionResult>, ExtractError> {
        self.inner
            .jobs
            .read(id, |job| match job.result() {
                Some(result) if job.status() == JobStatus::Completed => Ok(result.clone()),
                _ => Err(ExtractError::NotReady {
                    id: *id,
                    status: job.status(),
                }),
            })
            .await
            .ok_or(ExtractError::NotFound(*id))?
    }

    /// Serialize a completed job's result.
    pub async fn export(&self, id: &JobId, format: ExportFormat) -> Result<Vec<u8>, ExtractError> {
        let result = self.result(id).await?;
        export::render(&result, format)
    }

    /// Ask a job to stop.
    ///
    /// A queued job fails immediately. A processing job stops after its
    /// current unit of work. Returns `false` if the job already finished.
    pub async fn cancel(&self, id: &JobId) -> Result<bool, ExtractError> {
        let flag = self
            .inner
            .jobs
            .cancel_flag(id)
            .await
            .ok_or(ExtractError::NotFound(*id))?;
        let previous = self
            .inner
            .jobs
            .update(id, |job| {
                let previous = job.status();
                if previous == JobStatus::Queued {
                    let _ = job.fail(JobError::new(
                        FailureKind::Cancelled,
                        "cancelled before processing started",
                    ));
                }
                previous
            })
            .await
            .ok_or(ExtractError::NotFound(*id))?;
        match previous {
            JobStatus::Queued => {
                flag.cancel();
                tracing::info!(job_id = %id, "Cancelled while queued");
                Ok(true)
            }
            JobStatus::Processing => {
                flag.cancel();
                tracing::info!(job_id = %id, "Cancellation requested");
                Ok(true)
            }
            JobStatus::Completed | JobStatus::Failed => Ok(false),
        }
    }

    /// Forget a finished job and its result.
    pub async fn evict(&self, id: &JobId) -> Result<(), ExtractError> {
        let status = self.status(id).await?.status;
        if !status.is_terminal() {
            return Err(ExtractError::NotReady { id: *id, status });
        }
        self.inner.jobs.remove(id).await;
        Ok(())
    }

    pub async fn list_jobs(&self) -> Vec<JobSnapshot> {
        self.inner.jobs.list().await
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait(&self, id: &JobId, interval: Duration) -> Result<JobSnapshot, ExtractError> {
        loop {
            let snapshot = self.status(id).await?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Learn a template from a completed job.
    ///
    /// A layout that is already known yields [`LearnOutcome::Duplicate`].
    pub async fn learn_template(&self, id: &JobId) -> Result<LearnOutcome, ExtractError> {
        let result = self.result(id).await?;
        let filename = self.status(id).await?.original_filename;
        let name = Path::new(&filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.clone());
        let template = self
            .inner
            .learner
            .learn(
                &name,
                &result,
                TemplateSource::Learned {
                    job_id: id.to_string(),
                    filename,
                },
            )
            .ok_or(ExtractError::NothingToLearn(*id))?;
        let outcome = self.inner.templates.insert(template).await;
        log_learn(&outcome, &name);
        Ok(outcome)
    }

    /// Register a caller-defined template.
    pub async fn register_template(
        &self,
        definition: TemplateDefinition,
    ) -> Result<LearnOutcome, ExtractError> {
        check_definition(&definition)?;
        let name = definition.name.clone();
        let template = self.inner.learner.from_definition(definition);
        let outcome = self.inner.templates.insert(template).await;
        log_learn(&outcome, &name);
        Ok(outcome)
    }

    pub async fn get_template(&self, id: &TemplateId) -> Result<Arc<Template>, ExtractError> {
        self.inner
            .templates
            .get(id)
            .await
            .ok_or_else(|| ExtractError::TemplateNotFound(id.clone()))
    }

    pub async fn list_templates(&self) -> Vec<Arc<Template>> {
        self.inner.templates.list().await
    }

    pub fn engine_status(&self) -> Vec<EngineStatus> {
        self.inner
            .ensemble
            .members()
            .iter()
            .map(|m| EngineStatus {
                name: m.engine.name().to_string(),
                available: m.engine.is_available(),
                hint: m.engine.availability_hint(),
            })
            .collect()
    }

    /// Periodically evict terminal jobs past the retention window.
    ///
    /// The task ends once every orchestrator handle has been dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let retention = inner.settings.pipeline.retention();
                let removed = inner.jobs.sweep(retention).await;
                if removed > 0 {
                    tracing::info!("Evicted {} expired job(s)", removed);
                }
            }
        })
    }
}

impl Inner {
    async fn process(self: Arc<Self>, id: JobId, input: JobInput, cancel: CancelFlag) {
        let _permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.finish(id, Err(JobError::new(FailureKind::Internal, "worker pool closed")))
                    .await;
                return;
            }
        };

        // Cancelled or evicted while waiting for a slot.
        let still_queued = self
            .jobs
            .read(&id, |job| job.status() == JobStatus::Queued)
            .await
            .unwrap_or(false);
        if !still_queued {
            return;
        }

        // The deadline runs from dispatch, so decoding counts against it.
        let clock = Instant::now();
        let control = StageControl::new(cancel, self.settings.pipeline.job_timeout());

        let document = match input {
            JobInput::Decoded(document) => document,
            JobInput::Bytes(bytes) => match self.decode(&id, bytes, &control).await {
                Ok(document) => document,
                Err(error) => {
                    self.finish(id, Err(error)).await;
                    return;
                }
            },
        };

        let started = self.jobs.update(&id, |job| job.start()).await;
        match started {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::debug!(job_id = %id, "Not starting: {}", e);
                return;
            }
            None => return,
        }
        tracing::info!(job_id = %id, pages = document.page_count(), "Processing");

        let mut ctx = JobContext::new(id, document);
        let (tx, rx) = mpsc::channel(64);

        let run = async {
            let tx = tx;
            self.pipeline.run(&mut ctx, &control, &tx).await
        };
        let (outcome, ()) = tokio::join!(run, self.forward_progress(id, rx));

        let outcome = outcome.map(|degradations| {
            let elapsed = clock.elapsed().as_millis() as u64;
            ctx.into_result(degradations, elapsed)
        });
        self.finish(id, outcome).await;
    }

    async fn decode(
        &self,
        id: &JobId,
        bytes: Vec<u8>,
        control: &StageControl,
    ) -> Result<Document, JobError> {
        control.check()?;
        let filename = self
            .jobs
            .read(id, |job| job.original_filename.clone())
            .await
            .unwrap_or_default();
        let options = LoadOptions {
            pdf_dpi: self.settings.ocr.pdf_dpi,
            preprocess: self.settings.ocr.preprocess,
        };
        let decoded =
            tokio::time::timeout_at(control.deadline(), load_document(bytes, &filename, &options))
                .await;
        match decoded {
            Ok(result) => result.map_err(load_failure),
            Err(_) => Err(control.timeout_error()),
        }
    }

    async fn forward_progress(&self, id: JobId, mut rx: mpsc::Receiver<PipelineEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                PipelineEvent::Progress { percent, .. } => {
                    let _ = self.jobs.update(&id, |job| job.advance(percent)).await;
                }
                PipelineEvent::StageStarted { stage, units } => {
                    tracing::debug!(job_id = %id, stage = %stage, units, "Stage started");
                }
                PipelineEvent::StageCompleted { .. } | PipelineEvent::StageFailed { .. } => {}
            }
        }
    }

    async fn finish(&self, id: JobId, outcome: Result<ExtractionResult, JobError>) {
        let transition = match outcome {
            Ok(result) => {
                let fields = result.fields.len();
                let degraded = result.degradations.len();
                let transition = self.jobs.update(&id, |job| job.complete(result)).await;
                if matches!(transition, Some(Ok(()))) {
                    tracing::info!(job_id = %id, fields, degradations = degraded, "Completed");
                }
                transition
            }
            Err(error) => {
                tracing::warn!(job_id = %id, "Failed: {}", error);
                self.jobs.update(&id, |job| job.fail(error)).await
            }
        };
        if let Some(Err(e)) = transition {
            tracing::warn!(job_id = %id, "Dropped final transition: {}", e);
        }
    }
}

/// A malformed document is the caller's fault; a missing tool or a
/// filesystem error is ours.
fn load_failure(error: LoadError) -> JobError {
    let kind = if error.is_invalid_input() {
        FailureKind::InvalidInput
    } else {
        FailureKind::Internal
    };
    JobError::new(kind, error.to_string())
}

fn log_learn(outcome: &LearnOutcome, name: &str) {
    match outcome {
        LearnOutcome::Created(id) => tracing::info!(template = %id, "Learned template {}", name),
        LearnOutcome::Duplicate(id) => {
            tracing::info!(template = %id, "Layout of {} matches an existing template", name)
        }
    }
}

fn check_definition(definition: &TemplateDefinition) -> Result<(), ExtractError> {
    if definition.pages.is_empty() {
        return Err(ExtractError::InvalidTemplate("no pages".into()));
    }
    if definition.fields.is_empty() {
        return Err(ExtractError::InvalidTemplate("no fields".into()));
    }
    for field in &definition.fields {
        if field.page >= definition.pages.len() {
            return Err(ExtractError::InvalidTemplate(format!(
                "field {} is on page {} of {}",
                field.name,
                field.page + 1,
                definition.pages.len()
            )));
        }
        let in_page = |r: &crate::models::BoundingBox| {
            r.x >= 0.0 && r.y >= 0.0 && r.right() <= 1.0 && r.bottom() <= 1.0
        };
        if !in_page(&field.region) || !field.label_region.as_ref().map_or(true, in_page) {
            return Err(ExtractError::InvalidTemplate(format!(
                "field {} has a region outside the page",
                field.name
            )));
        }
    }
    Ok(())
}
