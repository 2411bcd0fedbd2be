//! Decoded documents and their rasterized pages.

use std::sync::Arc;

use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Source format of a submitted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Image,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Image => "image",
        }
    }
}

/// One rendered page. The raster is shared so pages can be handed to
/// several engines concurrently without copying pixels.
#[derive(Debug, Clone)]
pub struct Page {
    /// Zero-based page index.
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub raster: Arc<GrayImage>,
}

impl Page {
    pub fn new(index: usize, raster: GrayImage) -> Self {
        Self {
            index,
            width: raster.width(),
            height: raster.height(),
            raster: Arc::new(raster),
        }
    }

    /// 1-based page number for display.
    pub fn number(&self) -> usize {
        self.index + 1
    }
}

/// Page geometry without the raster; kept on results and templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageGeometry {
    pub index: usize,
    pub width: u32,
    pub height: u32,
}

impl From<&Page> for PageGeometry {
    fn from(page: &Page) -> Self {
        Self {
            index: page.index,
            width: page.width,
            height: page.height,
        }
    }
}

/// A decoded document: an ordered sequence of pages.
#[derive(Debug, Clone)]
pub struct Document {
    pub kind: DocumentKind,
    pub mime_type: String,
    pub pages: Vec<Page>,
}

impl Document {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn geometry(&self) -> Vec<PageGeometry> {
        self.pages.iter().map(PageGeometry::from).collect()
    }
}
