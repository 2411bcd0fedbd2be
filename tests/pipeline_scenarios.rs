//! End-to-end scenarios driven through the public orchestrator with
//! scripted OCR engines.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{GrayImage, ImageFormat, Luma};

use docsift::analysis::LearnOutcome;
use docsift::config::Settings;
use docsift::error::ExtractError;
use docsift::export::ExportFormat;
use docsift::jobs::Orchestrator;
use docsift::models::{
    BoundingBox, Degradation, Document, DocumentKind, FailureKind, JobId, JobSnapshot, JobStatus,
    Page, TemplateSource,
};
use docsift::ocr::{Candidate, OcrEngine, OcrError};

const POLL: Duration = Duration::from_millis(10);

/// Engine that returns a fixed reading, optionally failing on some pages.
struct Scripted {
    name: String,
    candidates: Vec<Candidate>,
    fail_on: Vec<usize>,
    delay: Duration,
}

impl Scripted {
    fn new(name: &str, candidates: Vec<Candidate>) -> Self {
        Self {
            name: name.to_string(),
            candidates,
            fail_on: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    fn failing_on(mut self, pages: &[usize]) -> Self {
        self.fail_on = pages.to_vec();
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl OcrEngine for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        true
    }

    fn availability_hint(&self) -> String {
        String::new()
    }

    async fn recognize(&self, page: &Page) -> Result<Vec<Candidate>, OcrError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_on.contains(&page.index) {
            return Err(OcrError::OcrFailed(format!("scripted failure on page {}", page.index)));
        }
        Ok(self.candidates.clone())
    }
}

/// Engine that returns the next of several readings on every call.
struct Sequenced {
    readings: Vec<Vec<Candidate>>,
    calls: AtomicUsize,
}

#[async_trait]
impl OcrEngine for Sequenced {
    fn name(&self) -> &str {
        "sequenced"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn availability_hint(&self) -> String {
        String::new()
    }

    async fn recognize(&self, _page: &Page) -> Result<Vec<Candidate>, OcrError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.readings[call % self.readings.len()].clone())
    }
}

fn blank_png(width: u32, height: u32) -> Vec<u8> {
    let image = GrayImage::from_pixel(width, height, Luma([255]));
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

fn blank_document(pages: usize) -> Document {
    Document {
        kind: DocumentKind::Image,
        mime_type: "image/png".into(),
        pages: (0..pages)
            .map(|i| Page::new(i, GrayImage::from_pixel(800, 600, Luma([255]))))
            .collect(),
    }
}

fn text(x: f32, y: f32, width: f32, value: &str, confidence: f32) -> Candidate {
    Candidate::new(BoundingBox::new(x, y, width, 20.0), value, confidence)
}

fn form_candidates() -> Vec<Candidate> {
    vec![
        text(50.0, 100.0, 60.0, "Name:", 0.95),
        text(130.0, 100.0, 200.0, "Ada Lovelace", 0.95),
        text(50.0, 200.0, 60.0, "Email:", 0.95),
        text(130.0, 200.0, 220.0, "ada@example.com", 0.95),
    ]
}

fn orchestrator(settings: Settings, engines: Vec<Scripted>) -> Orchestrator {
    let engines = engines
        .into_iter()
        .map(|e| Arc::new(e) as Arc<dyn OcrEngine>)
        .collect();
    Orchestrator::with_engines(settings, engines)
}

async fn wait(orchestrator: &Orchestrator, id: &JobId) -> JobSnapshot {
    tokio::time::timeout(Duration::from_secs(20), orchestrator.wait(id, POLL))
        .await
        .expect("job did not finish in time")
        .unwrap()
}

async fn wait_for_status(orchestrator: &Orchestrator, id: &JobId, status: JobStatus) {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if orchestrator.status(id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(POLL).await;
        }
    })
    .await
    .expect("status never reached");
}

#[tokio::test]
async fn test_agreeing_engines_merge_with_bonus() {
    let orchestrator = orchestrator(
        Settings::default(),
        vec![
            Scripted::new("a", vec![text(100.0, 50.0, 240.0, "INVOICE #123", 0.8)]),
            Scripted::new("b", vec![text(100.0, 50.0, 240.0, "INVOICE #123", 0.9)]),
        ],
    );

    let id = orchestrator.submit(blank_png(800, 600), "invoice.png").await;
    let snapshot = wait(&orchestrator, &id).await;
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.progress, 100);

    let result = orchestrator.result(&id).await.unwrap();
    assert_eq!(result.text_blocks.len(), 1);
    let block = &result.text_blocks[0];
    assert_eq!(block.text, "INVOICE #123");
    assert!(block.ocr_confidence > 0.9);
    assert!(result.degradations.is_empty());
}

#[tokio::test]
async fn test_single_engine_failure_is_absorbed() {
    let orchestrator = orchestrator(
        Settings::default(),
        vec![
            Scripted::new("a", form_candidates()).failing_on(&[0]),
            Scripted::new("b", form_candidates()),
        ],
    );

    let id = orchestrator.submit_document(blank_document(1), "form.png").await;
    assert_eq!(wait(&orchestrator, &id).await.status, JobStatus::Completed);

    let result = orchestrator.result(&id).await.unwrap();
    assert!(!result.text_blocks.is_empty());
    assert!(result.degradations.iter().any(|d| matches!(
        d,
        Degradation::EngineUnavailable { page: 0, engine, .. } if engine == "a"
    )));
    assert!(!result
        .degradations
        .iter()
        .any(|d| matches!(d, Degradation::AllEnginesFailed { .. })));
}

#[tokio::test]
async fn test_all_engines_failing_on_one_page() {
    let orchestrator = orchestrator(
        Settings::default(),
        vec![
            Scripted::new("a", form_candidates()).failing_on(&[0]),
            Scripted::new("b", form_candidates()).failing_on(&[0]),
        ],
    );

    let id = orchestrator.submit_document(blank_document(2), "two-pages.pdf").await;
    assert_eq!(wait(&orchestrator, &id).await.status, JobStatus::Completed);

    let result = orchestrator.result(&id).await.unwrap();
    assert_eq!(result.pages.len(), 2);
    assert_eq!(result.blocks_on_page(0).count(), 0);
    assert_eq!(result.blocks_on_page(1).count(), form_candidates().len());
    assert!(result.fields.iter().all(|f| f.page == 1));
    assert!(result
        .degradations
        .iter()
        .any(|d| matches!(d, Degradation::AllEnginesFailed { page: 0, .. })));
    assert_eq!(result.degraded_pages(), vec![0]);

    for (index, block) in result.text_blocks.iter().enumerate() {
        assert_eq!(block.id, index);
    }
}

#[tokio::test]
async fn test_unreadable_input_fails_without_progress() {
    let orchestrator = orchestrator(
        Settings::default(),
        vec![Scripted::new("a", form_candidates())],
    );

    let id = orchestrator
        .submit(b"definitely not a document".to_vec(), "junk.bin")
        .await;
    let snapshot = wait(&orchestrator, &id).await;
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.progress, 0);
    assert!(snapshot.started_at.is_none());
    assert_eq!(snapshot.error.unwrap().kind, FailureKind::InvalidInput);

    assert!(matches!(
        orchestrator.result(&id).await,
        Err(ExtractError::NotReady {
            status: JobStatus::Failed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_cancel_mid_processing() {
    let mut settings = Settings::default();
    settings.pipeline.page_concurrency = 1;
    let orchestrator = orchestrator(
        settings,
        vec![Scripted::new("a", form_candidates()).slow(Duration::from_millis(100))],
    );

    let id = orchestrator.submit_document(blank_document(20), "long.pdf").await;
    wait_for_status(&orchestrator, &id, JobStatus::Processing).await;
    assert!(orchestrator.cancel(&id).await.unwrap());

    let snapshot = wait(&orchestrator, &id).await;
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error.unwrap().kind, FailureKind::Cancelled);
    assert!(snapshot.progress < 100);

    assert!(matches!(
        orchestrator.result(&id).await,
        Err(ExtractError::NotReady { .. })
    ));
    assert!(orchestrator.learn_template(&id).await.is_err());
    assert!(orchestrator.list_templates().await.is_empty());
    assert!(!orchestrator.cancel(&id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_while_queued() {
    let mut settings = Settings::default();
    settings.pipeline.max_concurrent_jobs = 1;
    let orchestrator = orchestrator(
        settings,
        vec![Scripted::new("a", form_candidates()).slow(Duration::from_millis(200))],
    );

    let first = orchestrator.submit_document(blank_document(3), "first.png").await;
    let second = orchestrator.submit_document(blank_document(1), "second.png").await;
    wait_for_status(&orchestrator, &first, JobStatus::Processing).await;
    assert_eq!(
        orchestrator.status(&second).await.unwrap().status,
        JobStatus::Queued
    );

    assert!(orchestrator.cancel(&second).await.unwrap());
    let snapshot = orchestrator.status(&second).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error.unwrap().kind, FailureKind::Cancelled);

    assert_eq!(wait(&orchestrator, &first).await.status, JobStatus::Completed);
    assert_eq!(
        orchestrator.status(&second).await.unwrap().status,
        JobStatus::Failed
    );
}

#[tokio::test]
async fn test_timeout_is_distinct_from_cancel() {
    let mut settings = Settings::default();
    settings.pipeline.job_timeout_secs = 0;
    let orchestrator = orchestrator(
        settings,
        vec![Scripted::new("a", form_candidates())],
    );

    let id = orchestrator.submit_document(blank_document(1), "late.png").await;
    let snapshot = wait(&orchestrator, &id).await;
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error.unwrap().kind, FailureKind::Timeout);
}

#[tokio::test]
async fn test_deadline_covers_decoding() {
    let mut settings = Settings::default();
    settings.pipeline.job_timeout_secs = 0;
    let orchestrator = orchestrator(
        settings,
        vec![Scripted::new("a", form_candidates())],
    );

    let id = orchestrator.submit(blank_png(800, 600), "late.png").await;
    let snapshot = wait(&orchestrator, &id).await;
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error.unwrap().kind, FailureKind::Timeout);
    assert!(snapshot.started_at.is_none());
    assert_eq!(snapshot.progress, 0);
}

#[tokio::test]
async fn test_progress_never_decreases() {
    let mut settings = Settings::default();
    settings.pipeline.page_concurrency = 1;
    let orchestrator = orchestrator(
        settings,
        vec![Scripted::new("a", form_candidates()).slow(Duration::from_millis(20))],
    );

    let id = orchestrator.submit_document(blank_document(8), "pages.pdf").await;
    let mut seen = Vec::new();
    let snapshot = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let snapshot = orchestrator.status(&id).await.unwrap();
            seen.push(snapshot.progress);
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(snapshot.status, JobStatus::Completed);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", seen);
    assert_eq!(seen.last(), Some(&100));
}

#[tokio::test]
async fn test_learning_is_idempotent_and_guides_later_documents() {
    let orchestrator = orchestrator(
        Settings::default(),
        vec![Scripted::new("a", form_candidates())],
    );

    let first = orchestrator.submit_document(blank_document(1), "form-1.png").await;
    let second = orchestrator.submit_document(blank_document(1), "form-2.png").await;
    wait(&orchestrator, &first).await;
    wait(&orchestrator, &second).await;

    let before = orchestrator.result(&first).await.unwrap();
    assert!(before.template_id.is_none());
    assert!(before.fields.iter().any(|f| f.name == "email"));

    let learned = orchestrator.learn_template(&first).await.unwrap();
    let again = orchestrator.learn_template(&second).await.unwrap();
    assert!(!learned.is_duplicate());
    assert!(again.is_duplicate());
    assert_eq!(learned.template_id(), again.template_id());
    assert_eq!(orchestrator.list_templates().await.len(), 1);

    // Learning never touches results that already exist.
    let after = orchestrator.result(&first).await.unwrap();
    assert!(after.template_id.is_none());
    assert_eq!(after.fields, before.fields);

    let third = orchestrator.submit_document(blank_document(1), "form-3.png").await;
    assert_eq!(wait(&orchestrator, &third).await.status, JobStatus::Completed);
    let guided = orchestrator.result(&third).await.unwrap();
    assert_eq!(guided.template_id.as_ref(), Some(learned.template_id()));
    assert!(guided
        .fields
        .iter()
        .any(|f| f.template_field_index().is_some()));
}

#[tokio::test]
async fn test_same_form_with_different_values_learns_one_template() {
    let filled = |name: &str, name_width: f32, email: &str, email_width: f32| {
        vec![
            text(50.0, 100.0, 60.0, "Name:", 0.95),
            text(130.0, 100.0, name_width, name, 0.95),
            text(50.0, 200.0, 60.0, "Email:", 0.95),
            text(130.0, 200.0, email_width, email, 0.95),
        ]
    };
    let engine = Sequenced {
        readings: vec![
            filled("Ada", 40.0, "ada@x.io", 90.0),
            filled("Bartholomew Montgomery", 300.0, "bartholomew@example.com", 320.0),
        ],
        calls: AtomicUsize::new(0),
    };
    let engines: Vec<Arc<dyn OcrEngine>> = vec![Arc::new(engine)];
    let orchestrator = Orchestrator::with_engines(Settings::default(), engines);

    let first = orchestrator.submit_document(blank_document(1), "short.png").await;
    let second = orchestrator.submit_document(blank_document(1), "long.png").await;
    wait(&orchestrator, &first).await;
    wait(&orchestrator, &second).await;

    let learned = orchestrator.learn_template(&first).await.unwrap();
    let again = orchestrator.learn_template(&second).await.unwrap();
    assert!(!learned.is_duplicate());
    assert_eq!(again, LearnOutcome::Duplicate(learned.template_id().clone()));
    assert_eq!(orchestrator.list_templates().await.len(), 1);

    let template = orchestrator.get_template(learned.template_id()).await.unwrap();
    assert_eq!(template.name, "short");
    assert_eq!(
        template.source,
        TemplateSource::Learned {
            job_id: first.to_string(),
            filename: "short.png".into(),
        }
    );
}

#[tokio::test]
async fn test_export_and_eviction() {
    let orchestrator = orchestrator(
        Settings::default(),
        vec![Scripted::new("a", form_candidates())],
    );

    let id = orchestrator.submit_document(blank_document(1), "form.png").await;
    wait(&orchestrator, &id).await;

    let csv = String::from_utf8(orchestrator.export(&id, ExportFormat::Csv).await.unwrap()).unwrap();
    assert!(csv.starts_with("name,type,value"));
    assert!(csv.contains("ada@example.com"));

    let json = orchestrator.export(&id, ExportFormat::Json).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(value["text_blocks"].as_array().unwrap().len(), 4);

    assert_eq!(orchestrator.list_jobs().await.len(), 1);
    orchestrator.evict(&id).await.unwrap();
    assert!(matches!(
        orchestrator.status(&id).await,
        Err(ExtractError::NotFound(_))
    ));
    assert!(orchestrator.list_jobs().await.is_empty());
}
