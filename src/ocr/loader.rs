//! Decode submitted bytes into a rasterized [`Document`].
//!
//! The file type is sniffed from magic bytes, falling back to the filename
//! extension. PDFs are rasterized with pdftoppm; images are decoded
//! directly. Every page is converted to grayscale and optionally
//! contrast-stretched before OCR.

use std::path::Path;

use image::GrayImage;
use thiserror::Error;

use crate::models::{Document, DocumentKind, Page};

use super::pdf_utils;

/// Errors while decoding a submitted document.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Document is empty")]
    Empty,

    #[error("Unsupported document type: {0}")]
    UnsupportedType(String),

    #[error("Failed to decode document: {0}")]
    Decode(String),

    #[error("Required tool missing: {0}")]
    ToolMissing(String),

    #[error("Document has no pages")]
    NoPages,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decoder task failed: {0}")]
    Task(String),
}

impl LoadError {
    /// Whether the document itself is at fault, as opposed to the host
    /// (missing tools, filesystem errors).
    pub fn is_invalid_input(&self) -> bool {
        match self {
            LoadError::Empty
            | LoadError::UnsupportedType(_)
            | LoadError::Decode(_)
            | LoadError::NoPages => true,
            LoadError::ToolMissing(_) | LoadError::Io(_) | LoadError::Task(_) => false,
        }
    }
}

/// Options for decoding.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub pdf_dpi: u32,
    pub preprocess: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            pdf_dpi: 144,
            preprocess: true,
        }
    }
}

/// Determine the document kind and MIME type.
pub fn detect_kind(bytes: &[u8], filename: &str) -> Result<(DocumentKind, String), LoadError> {
    if let Some(detected) = infer::get(bytes) {
        let mime = detected.mime_type();
        if mime == "application/pdf" {
            return Ok((DocumentKind::Pdf, mime.to_string()));
        }
        if mime.starts_with("image/") {
            return Ok((DocumentKind::Image, mime.to_string()));
        }
        return Err(LoadError::UnsupportedType(mime.to_string()));
    }

    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());
    match ext.as_deref() {
        Some("pdf") => Ok((DocumentKind::Pdf, "application/pdf".to_string())),
        Some("png") => Ok((DocumentKind::Image, "image/png".to_string())),
        Some("jpg" | "jpeg") => Ok((DocumentKind::Image, "image/jpeg".to_string())),
        Some("tif" | "tiff") => Ok((DocumentKind::Image, "image/tiff".to_string())),
        Some("bmp") => Ok((DocumentKind::Image, "image/bmp".to_string())),
        Some(other) => Err(LoadError::UnsupportedType(other.to_string())),
        None => Err(LoadError::UnsupportedType("unknown".to_string())),
    }
}

async fn blocking<T, F>(f: F) -> Result<T, LoadError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LoadError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LoadError::Task(e.to_string()))?
}

/// Decode a document from raw bytes.
///
/// Image decoding and preprocessing run on the blocking pool; PDFs are
/// rasterized by a pdftoppm child that dies with the future.
pub async fn load_document(
    bytes: Vec<u8>,
    filename: &str,
    options: &LoadOptions,
) -> Result<Document, LoadError> {
    if bytes.is_empty() {
        return Err(LoadError::Empty);
    }
    let (kind, mime_type) = detect_kind(&bytes, filename)?;

    let rasters = match kind {
        DocumentKind::Pdf => pdf_utils::rasterize_pdf(&bytes, options.pdf_dpi).await?,
        DocumentKind::Image => blocking(move || {
            let image = image::load_from_memory(&bytes)
                .map_err(|e| LoadError::Decode(e.to_string()))?;
            Ok(vec![image.to_luma8()])
        })
        .await?,
    };

    let stretch = options.preprocess;
    let pages = blocking(move || {
        Ok(rasters
            .into_iter()
            .filter(|r| r.width() > 0 && r.height() > 0)
            .enumerate()
            .map(|(index, raster)| {
                let raster = if stretch { preprocess(raster) } else { raster };
                Page::new(index, raster)
            })
            .collect::<Vec<_>>())
    })
    .await?;

    if pages.is_empty() {
        return Err(LoadError::NoPages);
    }

    tracing::debug!(
        "Loaded {} ({}) with {} page(s)",
        filename,
        mime_type,
        pages.len()
    );
    Ok(Document {
        kind,
        mime_type,
        pages,
    })
}

/// Stretch contrast so the 1st and 99th intensity percentiles map to 0 and 255.
///
/// Flat images are returned unchanged.
pub fn preprocess(mut raster: GrayImage) -> GrayImage {
    let mut histogram = [0u64; 256];
    for pixel in raster.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    let cutoff = total / 100;

    let percentile = |from_dark: bool| -> u8 {
        let mut seen = 0u64;
        let order: Box<dyn Iterator<Item = usize>> = if from_dark {
            Box::new(0..256)
        } else {
            Box::new((0..256).rev())
        };
        for level in order {
            seen += histogram[level];
            if seen > cutoff {
                return level as u8;
            }
        }
        if from_dark {
            0
        } else {
            255
        }
    };
    let low = percentile(true);
    let high = percentile(false);
    if high <= low {
        return raster;
    }

    let span = (high - low) as f32;
    for pixel in raster.pixels_mut() {
        let v = pixel.0[0].clamp(low, high);
        pixel.0[0] = (((v - low) as f32 / span) * 255.0).round() as u8;
    }
    raster
}
