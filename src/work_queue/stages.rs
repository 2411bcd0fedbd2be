//! The four document-processing stages: OCR, detection, scoring, validation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::analysis::{
    dedupe_names, ConfidenceScorer, DetectionMode, FieldDetector, TemplateStore, ValidationEngine,
};
use crate::config::Settings;
use crate::models::Degradation;
use crate::ocr::OcrEnsemble;

use super::control::StageControl;
use super::pipeline::{JobContext, PipelineStage, StageOutcome, StageReporter};
use super::runner::PipelineRunner;

/// Recognizes every page with the engine ensemble.
///
/// Pages run concurrently but are collected in page order, so text block
/// ids are stable document-wide indices.
pub struct OcrStage {
    ensemble: Arc<OcrEnsemble>,
    page_concurrency: usize,
}

impl OcrStage {
    pub fn new(ensemble: Arc<OcrEnsemble>, page_concurrency: usize) -> Self {
        Self {
            ensemble,
            page_concurrency: page_concurrency.max(1),
        }
    }
}

#[async_trait]
impl PipelineStage for OcrStage {
    fn name(&self) -> &str {
        "ocr"
    }

    fn units(&self, ctx: &JobContext) -> usize {
        ctx.document.page_count()
    }

    async fn run(
        &self,
        ctx: &mut JobContext,
        control: &StageControl,
        reporter: &StageReporter<'_>,
    ) -> StageOutcome {
        let JobContext {
            job_id,
            document,
            blocks,
            ..
        } = ctx;
        let total = document.pages.len();
        let ensemble = self.ensemble.as_ref();
        let mut degradations = Vec::new();

        let recognitions: Vec<_> = document
            .pages
            .iter()
            .map(|page| ensemble.process_page(page))
            .collect();
        let mut pages =
            std::pin::pin!(stream::iter(recognitions).buffered(self.page_concurrency));

        let mut done = 0;
        while let Some((page_blocks, page_degradations)) = pages.next().await {
            done += 1;
            tracing::debug!(
                job_id = %job_id,
                page = done,
                blocks = page_blocks.len(),
                "Page recognized"
            );
            for mut block in page_blocks {
                block.id = blocks.len();
                blocks.push(block);
            }
            degradations.extend(page_degradations);
            reporter.units_done(done, total).await;

            if let Err(error) = control.check() {
                return StageOutcome::Fatal(error);
            }
        }

        StageOutcome::Completed { degradations }
    }
}

/// Picks the detection mode and finds fields page by page.
pub struct DetectionStage {
    detector: FieldDetector,
    templates: Arc<TemplateStore>,
    match_threshold: f32,
}

impl DetectionStage {
    pub fn new(detector: FieldDetector, templates: Arc<TemplateStore>, match_threshold: f32) -> Self {
        Self {
            detector,
            templates,
            match_threshold,
        }
    }
}

#[async_trait]
impl PipelineStage for DetectionStage {
    fn name(&self) -> &str {
        "detection"
    }

    fn units(&self, ctx: &JobContext) -> usize {
        ctx.document.page_count()
    }

    async fn run(
        &self,
        ctx: &mut JobContext,
        control: &StageControl,
        reporter: &StageReporter<'_>,
    ) -> StageOutcome {
        let geometry = ctx.document.geometry();
        ctx.template = self
            .templates
            .find_match(&geometry, &ctx.blocks, self.match_threshold)
            .await;
        let mode = match &ctx.template {
            Some(template) => {
                tracing::info!(
                    job_id = %ctx.job_id,
                    template = %template.id,
                    "Using template {}",
                    template.name
                );
                DetectionMode::Templated(template.clone())
            }
            None => DetectionMode::Generic,
        };

        let total = ctx.document.pages.len();
        let mut detected = Vec::new();
        for (done, page) in ctx.document.pages.iter().enumerate() {
            detected.extend(self.detector.detect(page, &ctx.blocks, &mode));
            reporter.units_done(done + 1, total).await;
            if let Err(error) = control.check() {
                return StageOutcome::Fatal(error);
            }
        }
        dedupe_names(&mut detected);
        ctx.detected = detected;
        StageOutcome::ok()
    }
}

/// Assigns OCR and layout confidence to every detected field.
pub struct ScoringStage {
    scorer: Arc<ConfidenceScorer>,
}

impl ScoringStage {
    pub fn new(scorer: Arc<ConfidenceScorer>) -> Self {
        Self { scorer }
    }
}

#[async_trait]
impl PipelineStage for ScoringStage {
    fn name(&self) -> &str {
        "scoring"
    }

    fn units(&self, _ctx: &JobContext) -> usize {
        1
    }

    async fn run(
        &self,
        ctx: &mut JobContext,
        _control: &StageControl,
        _reporter: &StageReporter<'_>,
    ) -> StageOutcome {
        let detected = std::mem::take(&mut ctx.detected);
        ctx.fields = detected
            .into_iter()
            .map(|field| self.scorer.score_field(field, &ctx.blocks))
            .collect();
        StageOutcome::ok()
    }
}

/// Validates fields, folds the outcome into their scores and summarizes
/// document confidence.
pub struct ValidationStage {
    engine: ValidationEngine,
    scorer: Arc<ConfidenceScorer>,
}

impl ValidationStage {
    pub fn new(scorer: Arc<ConfidenceScorer>) -> Self {
        Self {
            engine: ValidationEngine::new(),
            scorer,
        }
    }
}

#[async_trait]
impl PipelineStage for ValidationStage {
    fn name(&self) -> &str {
        "validation"
    }

    fn units(&self, _ctx: &JobContext) -> usize {
        1
    }

    async fn run(
        &self,
        ctx: &mut JobContext,
        _control: &StageControl,
        _reporter: &StageReporter<'_>,
    ) -> StageOutcome {
        let summary = self
            .engine
            .validate_all(&ctx.fields, ctx.template.as_deref());
        self.scorer.apply_validation(&mut ctx.fields, &summary);

        let degradations: Vec<Degradation> = summary
            .results
            .iter()
            .flat_map(|result| {
                result.skipped_rules.iter().map(|skipped| Degradation::RuleSkipped {
                    field: result.field_name.clone(),
                    rule_id: skipped.rule_id.clone(),
                    reason: skipped.reason.clone(),
                })
            })
            .collect();

        ctx.confidence = self.scorer.document_summary(&ctx.blocks, &ctx.fields);
        ctx.validation = summary;
        StageOutcome::Completed { degradations }
    }
}

/// Build the standard OCR → detection → scoring → validation pipeline.
pub fn standard_pipeline(
    ensemble: Arc<OcrEnsemble>,
    templates: Arc<TemplateStore>,
    settings: &Settings,
) -> PipelineRunner {
    let weights = settings.pipeline.stage_weights;
    let scorer = Arc::new(ConfidenceScorer::new(settings.scoring.clone()));

    let mut runner = PipelineRunner::new();
    runner.add_stage(
        Box::new(OcrStage::new(ensemble, settings.pipeline.page_concurrency)),
        weights.ocr as u32,
    );
    runner.add_stage(
        Box::new(DetectionStage::new(
            FieldDetector::new(settings.detection.clone()),
            templates,
            settings.templates.match_threshold,
        )),
        weights.detection as u32,
    );
    runner.add_stage(Box::new(ScoringStage::new(scorer.clone())), weights.scoring as u32);
    runner.add_stage(Box::new(ValidationStage::new(scorer)), weights.validation as u32);
    runner
}
