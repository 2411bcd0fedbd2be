//! Export of finished extraction results.
//!
//! `json` is the whole result record. `jsonl` and `csv` are flat tables:
//! one row per field, or one row per text block when no field was found.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::ExtractError;
use crate::models::{ExtractionResult, Field, TextBlock};

/// Export format options.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Jsonl,
    Csv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Csv => "csv",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, ExtractError> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            "csv" => Ok(Self::Csv),
            other => Err(ExtractError::InvalidFormat(other.to_string())),
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Jsonl => "application/x-ndjson",
            Self::Csv => "text/csv",
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat view of one field.
#[derive(Debug, Serialize)]
struct FieldRecord<'a> {
    name: &'a str,
    field_type: &'static str,
    value: String,
    page: usize,
    confidence: f32,
    ocr_confidence: f32,
    layout_confidence: f32,
    validation_confidence: Option<f32>,
    passed: Option<bool>,
    failed_rule: Option<&'a str>,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

/// Flat view of one text block.
#[derive(Debug, Serialize)]
struct BlockRecord<'a> {
    id: usize,
    page: usize,
    text: &'a str,
    confidence: f32,
    engines: String,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

fn field_records(result: &ExtractionResult) -> Vec<FieldRecord<'_>> {
    result
        .fields
        .iter()
        .enumerate()
        .map(|(index, field): (usize, &Field)| {
            let validation = result.validation.for_field(index);
            FieldRecord {
                name: &field.name,
                field_type: field.field_type.as_str(),
                value: field.value.as_text(),
                page: field.page,
                confidence: field.confidence(),
                ocr_confidence: field.score.ocr_confidence(),
                layout_confidence: field.score.layout_confidence(),
                validation_confidence: field.score.validation_confidence(),
                passed: validation.map(|v| v.passed),
                failed_rule: validation.and_then(|v| v.failed_rule.as_deref()),
                x: field.bbox.x,
                y: field.bbox.y,
                width: field.bbox.width,
                height: field.bbox.height,
            }
        })
        .collect()
}

fn block_records(result: &ExtractionResult) -> Vec<BlockRecord<'_>> {
    result
        .text_blocks
        .iter()
        .map(|block: &TextBlock| BlockRecord {
            id: block.id,
            page: block.page,
            text: &block.text,
            confidence: block.ocr_confidence,
            engines: block.agreed_engines().join(";"),
            x: block.bbox.x,
            y: block.bbox.y,
            width: block.bbox.width,
            height: block.bbox.height,
        })
        .collect()
}

/// Serialize a result in the requested format.
pub fn render(result: &ExtractionResult, format: ExportFormat) -> Result<Vec<u8>, ExtractError> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_vec_pretty(result)?),
        ExportFormat::Jsonl => {
            let mut output = Vec::new();
            if result.fields.is_empty() {
                for record in block_records(result) {
                    write_line(&mut output, &serde_json::to_string(&record)?)?;
                }
            } else {
                for record in field_records(result) {
                    write_line(&mut output, &serde_json::to_string(&record)?)?;
                }
            }
            Ok(output)
        }
        ExportFormat::Csv => render_csv(result),
    }
}

fn render_csv(result: &ExtractionResult) -> Result<Vec<u8>, ExtractError> {
    let mut output = Vec::new();
    if result.fields.is_empty() {
        write_line(&mut output, "id,page,text,confidence,engines,x,y,width,height")?;
        for r in block_records(result) {
            let line = format!(
                "{},{},{},{:.4},{},{},{},{},{}",
                r.id,
                r.page + 1,
                escape_csv(r.text),
                r.confidence,
                escape_csv(&r.engines),
                r.x,
                r.y,
                r.width,
                r.height
            );
            write_line(&mut output, &line)?;
        }
        return Ok(output);
    }

    write_line(
        &mut output,
        "name,type,value,page,confidence,ocr_confidence,layout_confidence,validation_confidence,passed,failed_rule,x,y,width,height",
    )?;
    for r in field_records(result) {
        let line = format!(
            "{},{},{},{},{:.4},{:.4},{:.4},{},{},{},{},{},{},{}",
            escape_csv(r.name),
            r.field_type,
            escape_csv(&r.value),
            r.page + 1,
            r.confidence,
            r.ocr_confidence,
            r.layout_confidence,
            r.validation_confidence
                .map(|v| format!("{:.4}", v))
                .unwrap_or_default(),
            r.passed.map(|p| p.to_string()).unwrap_or_default(),
            escape_csv(r.failed_rule.unwrap_or("")),
            r.x,
            r.y,
            r.width,
            r.height
        );
        write_line(&mut output, &line)?;
    }
    Ok(output)
}

fn write_line(output: &mut Vec<u8>, line: &str) -> Result<(), ExtractError> {
    writeln!(output, "{}", line).map_err(|e| ExtractError::Export(e.to_string()))
}

fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
