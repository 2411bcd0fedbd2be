//! Tesseract OCR engine.
//!
//! Runs the `tesseract` binary with TSV output and groups recognized
//! words into line candidates. Different page segmentation or engine
//! modes recognize differently enough to act as separate engines.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use crate::config::EngineEntry;
use crate::models::{BoundingBox, Page};

use super::backend::{check_binary, Candidate, OcrEngine, OcrError};

/// Tesseract OCR engine.
pub struct TesseractEngine {
    name: String,
    language: String,
    psm: Option<u8>,
    oem: Option<u8>,
    /// Hard stop for the subprocess; the ensemble applies its own timeout too.
    process_timeout: Option<Duration>,
}

impl TesseractEngine {
    pub fn new(name: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: language.into(),
            psm: None,
            oem: None,
            process_timeout: None,
        }
    }

    pub fn from_entry(entry: &EngineEntry) -> Self {
        Self {
            name: entry.name.clone(),
            language: entry.language.clone(),
            psm: entry.psm,
            oem: entry.oem,
            process_timeout: entry.timeout_secs.map(Duration::from_secs),
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec!["-l".to_string(), self.language.clone()];
        if let Some(psm) = self.psm {
            args.push("--psm".to_string());
            args.push(psm.to_string());
        }
        if let Some(oem) = self.oem {
            args.push("--oem".to_string());
            args.push(oem.to_string());
        }
        args.push("tsv".to_string());
        args
    }

    async fn run_tesseract(&self, page: &Page) -> Result<String, OcrError> {
        let temp_dir = TempDir::new()?;
        let image_path = temp_dir.path().join(format!("page-{}.png", page.number()));
        page.raster
            .save(&image_path)
            .map_err(|e| OcrError::ImageError(e.to_string()))?;

        let mut command = Command::new("tesseract");
        command
            .arg(&image_path)
            .arg("stdout")
            .args(self.args())
            .kill_on_drop(true);

        let output = match self.process_timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| OcrError::Timeout {
                    engine: self.name.clone(),
                    secs: limit.as_secs(),
                })?,
            None => command.output().await,
        };

        match output {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(OcrError::OcrFailed(format!("tesseract failed: {}", stderr.trim())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                OcrError::EngineNotAvailable("tesseract not found (install tesseract-ocr)".into()),
            ),
            Err(e) => Err(OcrError::Io(e)),
        }
    }

    /// Parse tesseract TSV output into line candidates.
    ///
    /// Word rows (level 5) with negative confidence or blank text are
    /// dropped. Remaining words are grouped by block, paragraph and line;
    /// each line's box is the union of its words and its confidence the
    /// mean word confidence scaled to [0, 1].
    pub fn parse_tsv(tsv: &str) -> Vec<Candidate> {
        let mut lines: BTreeMap<(u32, u32, u32, u32), Vec<(BoundingBox, String, f32)>> =
            BTreeMap::new();

        for row in tsv.lines().skip(1) {
            let cols: Vec<&str> = row.split('\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                continue;
            }
            let nums: Option<Vec<u32>> = cols[1..10].iter().map(|c| c.parse().ok()).collect();
            let Some(nums) = nums else {
                continue;
            };
            let Ok(conf) = cols[10].parse::<f32>() else {
                continue;
            };
            let text = cols[11..].join("\t");
            let text = text.trim();
            if conf < 0.0 || text.is_empty() {
                continue;
            }
            let bbox = BoundingBox::new(nums[5] as f32, nums[6] as f32, nums[7] as f32, nums[8] as f32);
            lines
                .entry((nums[0], nums[1], nums[2], nums[3]))
                .or_default()
                .push((bbox, text.to_string(), conf / 100.0));
        }

        lines
            .into_values()
            .filter_map(|words| {
                let mut iter = words.iter();
                let first = iter.next()?;
                let bbox = iter.fold(first.0, |acc, w| acc.union(&w.0));
                let text = words
                    .iter()
                    .map(|w| w.1.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                let confidence = words.iter().map(|w| w.2).sum::<f32>() / words.len() as f32;
                Some(Candidate::new(bbox, text, confidence))
            })
            .collect()
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        check_binary("tesseract")
    }

    fn availability_hint(&self) -> String {
        if check_binary("tesseract") {
            "Tesseract is available".to_string()
        } else {
            "Tesseract not installed. Install with: apt install tesseract-ocr".to_string()
        }
    }

    async fn recognize(&self, page: &Page) -> Result<Vec<Candidate>, OcrError> {
        let tsv = self.run_tesseract(page).await?;
        let candidates = Self::parse_tsv(&tsv);
        tracing::debug!(
            engine = %self.name,
            page = page.index,
            "tesseract produced {} line candidates",
            candidates.len()
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn test_parse_tsv_groups_words_into_lines() {
        let tsv = format!(
            "{HEADER}\n\
             1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t\n\
             5\t1\t1\t1\t1\t1\t10\t20\t80\t15\t90\tINVOICE\n\
             5\t1\t1\t1\t1\t2\t100\t20\t40\t15\t70\t#123\n\
             5\t1\t1\t1\t2\t1\t10\t50\t60\t15\t-1\t \n\
             5\t1\t1\t1\t3\t1\t10\t80\t50\t12\t60\tTotal:\n"
        );
        let candidates = TesseractEngine::parse_tsv(&tsv);
        assert_eq!(candidates.len(), 2);

        assert_eq!(candidates[0].text, "INVOICE #123");
        assert!((candidates[0].confidence - 0.8).abs() < 1e-6);
        assert_eq!(candidates[0].bbox, BoundingBox::new(10.0, 20.0, 130.0, 15.0));

        assert_eq!(candidates[1].text, "Total:");
        assert!((candidates[1].confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_parse_tsv_ignores_garbage() {
        assert!(TesseractEngine::parse_tsv("").is_empty());
        assert!(TesseractEngine::parse_tsv("not\ttsv\nat all").is_empty());
    }

    #[test]
    fn test_args_include_modes() {
        let engine = TesseractEngine::from_entry(&EngineEntry::tesseract("sparse", 11));
        let args = engine.args();
        assert!(args.windows(2).any(|w| w[0] == "--psm" && w[1] == "11"));
        assert_eq!(args.last().map(String::as_str), Some("tsv"));
    }
}
