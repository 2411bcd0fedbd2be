//! `process` command: run documents through the extraction pipeline.

use std::path::{Path, PathBuf};

use console::style;

use docsift::analysis::LearnOutcome;
use docsift::config::Settings;
use docsift::error::ExtractError;
use docsift::export::ExportFormat;
use docsift::jobs::Orchestrator;
use docsift::models::{JobId, JobStatus, TemplateDefinition};

use crate::cli::progress::follow_job;

pub struct ProcessOptions {
    pub files: Vec<PathBuf>,
    pub format: ExportFormat,
    pub output: Option<PathBuf>,
    pub learn: bool,
    pub templates: Vec<PathBuf>,
    pub save_templates: Option<PathBuf>,
    pub quiet: bool,
}

/// Process each file in order.
///
/// Files run one after another so that a template learned from one file
/// already applies to the next.
pub async fn cmd_process(settings: Settings, options: ProcessOptions) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(settings);

    let engines = orchestrator.engine_status();
    if engines.iter().all(|e| !e.available) {
        eprintln!(
            "{} No OCR engine is available; run `docsift engines` for details",
            style("!").yellow()
        );
    }

    for path in &options.templates {
        load_template(&orchestrator, path).await?;
    }

    let several = options.files.len() > 1;
    if let Some(dir) = options.output.as_deref().filter(|_| several) {
        std::fs::create_dir_all(dir)?;
    }

    let mut failed = 0usize;
    for file in &options.files {
        let label = display_name(file);
        let bytes = match tokio::fs::read(file).await {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("{} {}: {}", style("✗").red(), label, e);
                failed += 1;
                continue;
            }
        };

        let id = orchestrator.submit(bytes, &label).await;
        let snapshot = follow_job(&orchestrator, &id, &label, !options.quiet).await?;

        if snapshot.status != JobStatus::Completed {
            let reason = snapshot
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| snapshot.status.to_string());
            eprintln!("{} {}: {}", style("✗").red(), label, reason);
            failed += 1;
            continue;
        }

        report(&orchestrator, &id, &label).await?;

        let rendered = orchestrator.export(&id, options.format).await?;
        match output_path(options.output.as_deref(), file, options.format, several) {
            Some(target) => {
                tokio::fs::write(&target, &rendered).await?;
                eprintln!("  {} {}", style("→").green(), target.display());
            }
            None => {
                use std::io::Write;
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&rendered)?;
                stdout.flush()?;
            }
        }

        if options.learn {
            learn(&orchestrator, &id, options.save_templates.as_deref()).await?;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} document(s) failed", failed, options.files.len());
    }
    Ok(())
}

async fn load_template(orchestrator: &Orchestrator, path: &Path) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(path).await?;
    let definition: TemplateDefinition = serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
    let outcome = orchestrator.register_template(definition).await?;
    if outcome.is_duplicate() {
        eprintln!(
            "  {} {} duplicates template {}",
            style("○").yellow(),
            path.display(),
            outcome.template_id()
        );
    }
    Ok(())
}

async fn report(orchestrator: &Orchestrator, id: &JobId, label: &str) -> anyhow::Result<()> {
    let result = orchestrator.result(id).await?;
    eprintln!(
        "{} {}: {} page(s), {} block(s), {} field(s), confidence {:.0}%",
        style("✓").green(),
        label,
        result.pages.len(),
        result.text_blocks.len(),
        result.fields.len(),
        result.confidence.overall * 100.0
    );
    if result.validation.failed > 0 {
        eprintln!(
            "  {} {} field(s) failed validation",
            style("!").yellow(),
            result.validation.failed
        );
    }
    if result.confidence.low_confidence_fields > 0 {
        eprintln!(
            "  {} {} low-confidence field(s)",
            style("!").yellow(),
            result.confidence.low_confidence_fields
        );
    }
    for degradation in &result.degradations {
        eprintln!("  {} {}", style("!").yellow(), style(describe(degradation)).dim());
    }
    if let Some(template) = &result.template_id {
        eprintln!("  {} template {}", style("→").cyan(), template);
    }
    Ok(())
}

fn describe(degradation: &docsift::models::Degradation) -> String {
    use docsift::models::Degradation;
    match degradation {
        Degradation::EngineUnavailable {
            page,
            engine,
            reason,
        } => format!("page {}: engine {} skipped ({})", page + 1, engine, reason),
        Degradation::AllEnginesFailed { page, .. } => {
            format!("page {}: no engine could read this page", page + 1)
        }
        Degradation::RuleSkipped {
            field,
            rule_id,
            reason,
        } => format!("field {}: rule {} skipped ({})", field, rule_id, reason),
    }
}

async fn learn(
    orchestrator: &Orchestrator,
    id: &JobId,
    save_dir: Option<&Path>,
) -> anyhow::Result<()> {
    match orchestrator.learn_template(id).await {
        Ok(LearnOutcome::Created(template_id)) => {
            eprintln!("  {} learned template {}", style("+").green(), template_id);
            if let Some(dir) = save_dir {
                let template = orchestrator.get_template(&template_id).await?;
                std::fs::create_dir_all(dir)?;
                let short: String = template_id.as_str().chars().take(8).collect();
                let path = dir.join(format!("{}-{}.json", template.name, short));
                tokio::fs::write(&path, serde_json::to_vec_pretty(template.as_ref())?).await?;
                eprintln!("  {} {}", style("→").green(), path.display());
            }
        }
        Ok(LearnOutcome::Duplicate(template_id)) => {
            eprintln!(
                "  {} layout already known as template {}",
                style("○").yellow(),
                template_id
            );
        }
        Err(ExtractError::NothingToLearn(_)) => {
            eprintln!(
                "  {}",
                style("no fields confident enough to learn a template").dim()
            );
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Where to write the export for `input`, or `None` for stdout.
fn output_path(
    output: Option<&Path>,
    input: &Path,
    format: ExportFormat,
    several: bool,
) -> Option<PathBuf> {
    let output = output?;
    if several || output.is_dir() {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        Some(output.join(format!("{}.{}", stem, format.extension())))
    } else {
        Some(output.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path() {
        let input = Path::new("scans/form.pdf");
        assert_eq!(output_path(None, input, ExportFormat::Json, false), None);
        assert_eq!(
            output_path(Some(Path::new("out.csv")), input, ExportFormat::Csv, false),
            Some(PathBuf::from("out.csv"))
        );
        assert_eq!(
            output_path(Some(Path::new("exports")), input, ExportFormat::Jsonl, true),
            Some(PathBuf::from("exports/form.jsonl"))
        );
    }
}
