//! PDF-to-image conversion via pdftoppm.

use std::path::{Path, PathBuf};

use image::GrayImage;
use tempfile::TempDir;
use tokio::process::Command;

use super::loader::LoadError;

pub const PDFTOPPM_NOT_FOUND: &str = "pdftoppm not found (install poppler-utils)";

/// Rasterize every page of a PDF at `dpi`, returning grayscale pages in order.
///
/// pdftoppm is killed if the returned future is dropped, so callers can
/// bound the conversion with a timeout.
pub async fn rasterize_pdf(pdf_bytes: &[u8], dpi: u32) -> Result<Vec<GrayImage>, LoadError> {
    let temp_dir = TempDir::new()?;
    let pdf_path = temp_dir.path().join("input.pdf");
    tokio::fs::write(&pdf_path, pdf_bytes).await?;
    let output_prefix = temp_dir.path().join("page");

    let status = Command::new("pdftoppm")
        .args(["-png", "-gray", "-r", &dpi.to_string()])
        .arg(&pdf_path)
        .arg(&output_prefix)
        .kill_on_drop(true)
        .status()
        .await;

    match status {
        Ok(s) if s.success() => {}
        Ok(_) => {
            return Err(LoadError::Decode(
                "pdftoppm failed to convert PDF".to_string(),
            ))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LoadError::ToolMissing(PDFTOPPM_NOT_FOUND.to_string()))
        }
        Err(e) => return Err(LoadError::Io(e)),
    }

    tokio::task::spawn_blocking(move || read_pages(&temp_dir))
        .await
        .map_err(|e| LoadError::Task(e.to_string()))?
}

fn read_pages(temp_dir: &TempDir) -> Result<Vec<GrayImage>, LoadError> {
    let mut pages = Vec::new();
    let mut page_num = 1;
    while let Some(path) = find_page_image(temp_dir.path(), page_num) {
        let image = image::open(&path)
            .map_err(|e| LoadError::Decode(format!("page {}: {}", page_num, e)))?;
        pages.push(image.to_luma8());
        page_num += 1;
    }
    if pages.is_empty() {
        return Err(LoadError::NoPages);
    }
    Ok(pages)
}

/// Find the image file for a specific page number.
///
/// pdftoppm names files like page-01.png, page-02.png, etc.
/// The padding width varies based on total page count.
pub fn find_page_image(temp_path: &Path, page_num: u32) -> Option<PathBuf> {
    for digits in [1, 2, 3, 4] {
        let filename = format!("page-{:0width$}.png", page_num, width = digits);
        let path = temp_path.join(&filename);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_page_image_not_found() {
        let temp = TempDir::new().unwrap();
        assert!(find_page_image(temp.path(), 1).is_none());
    }

    #[test]
    fn test_find_page_image_with_2_digit_padding() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("page-01.png");
        std::fs::write(&path, b"fake png").unwrap();

        assert_eq!(find_page_image(temp.path(), 1), Some(path));
        assert!(find_page_image(temp.path(), 2).is_none());
    }

    #[test]
    fn test_find_page_image_with_3_digit_padding() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("page-012.png");
        std::fs::write(&path, b"fake png").unwrap();

        assert_eq!(find_page_image(temp.path(), 12), Some(path));
    }
}
