//! Raster analysis for marks that OCR cannot read.
//!
//! Checkboxes and radio buttons are small near-square ink outlines;
//! whether they are ticked comes from the ink ratio of their interior.
//! Signatures are larger clusters of irregular strokes away from any
//! recognized text. None of this consults OCR text.

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;

use crate::config::DetectionConfig;
use crate::models::{BoundingBox, Page};

/// Outline shape of a mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkShape {
    /// Checkbox.
    Square,
    /// Radio button.
    Round,
}

/// A checkbox or radio button found in the raster.
#[derive(Debug, Clone, PartialEq)]
pub struct Mark {
    pub bbox: BoundingBox,
    pub shape: MarkShape,
    pub filled: bool,
    /// Ink ratio of the interior.
    pub fill_ratio: f32,
    /// How decisively the fill ratio sits on one side of the threshold (0..1).
    pub clarity: f32,
}

/// A probable handwritten signature.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureRegion {
    pub bbox: BoundingBox,
    pub density: f32,
}

/// Ink mask: dark pixels become 255, everything else 0.
pub fn binarize(raster: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(raster.width(), raster.height(), |x, y| {
        if raster.get_pixel(x, y).0[0] < threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Share of ink pixels in the half-open pixel rectangle.
fn ink_ratio(ink: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> f32 {
    let x1 = x1.min(ink.width());
    let y1 = y1.min(ink.height());
    if x0 >= x1 || y0 >= y1 {
        return 0.0;
    }
    let mut count = 0u32;
    for y in y0..y1 {
        for x in x0..x1 {
            if ink.get_pixel(x, y).0[0] > 0 {
                count += 1;
            }
        }
    }
    count as f32 / ((x1 - x0) * (y1 - y0)) as f32
}

fn pixel_rect(bbox: &BoundingBox) -> (u32, u32, u32, u32) {
    (
        bbox.x.max(0.0) as u32,
        bbox.y.max(0.0) as u32,
        bbox.right().max(0.0).ceil() as u32,
        bbox.bottom().max(0.0).ceil() as u32,
    )
}

/// Bounding boxes of outermost ink components.
fn outer_components(ink: &GrayImage) -> Vec<BoundingBox> {
    find_contours::<u32>(ink)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter_map(|c| {
            let min_x = c.points.iter().map(|p| p.x).min()?;
            let max_x = c.points.iter().map(|p| p.x).max()?;
            let min_y = c.points.iter().map(|p| p.y).min()?;
            let max_y = c.points.iter().map(|p| p.y).max()?;
            Some(BoundingBox::from_coords(
                min_x as f32,
                min_y as f32,
                (max_x + 1) as f32,
                (max_y + 1) as f32,
            ))
        })
        .collect()
}

fn overlaps_text(bbox: &BoundingBox, text_boxes: &[BoundingBox], limit: f32) -> bool {
    text_boxes.iter().any(|t| bbox.coverage_by(t) > limit)
}

/// Decide shape and fill of a candidate mark outline.
///
/// Returns `None` when the component is not an outline (a solid blob or a
/// stray glyph). The outline ring is the outer fifth of the box; a round
/// outline leaves the box corners empty.
pub fn classify_mark(ink: &GrayImage, bbox: &BoundingBox, config: &DetectionConfig) -> Option<Mark> {
    let (x0, y0, x1, y1) = pixel_rect(bbox);
    let w = x1.saturating_sub(x0);
    let h = y1.saturating_sub(y0);
    let edge = (w.min(h) / 5).max(1);
    let corner = (w.min(h) / 5).max(1);

    let top = ink_ratio(ink, x0, y0, x1, y0 + edge);
    let bottom = ink_ratio(ink, x0, y1 - edge, x1, y1);
    let left = ink_ratio(ink, x0, y0, x0 + edge, y1);
    let right = ink_ratio(ink, x1 - edge, y0, x1, y1);
    let ring = (top + bottom + left + right) / 4.0;

    let corners = [
        ink_ratio(ink, x0, y0, x0 + corner, y0 + corner),
        ink_ratio(ink, x1 - corner, y0, x1, y0 + corner),
        ink_ratio(ink, x0, y1 - corner, x0 + corner, y1),
        ink_ratio(ink, x1 - corner, y1 - corner, x1, y1),
    ];
    let corner_ink = corners.iter().sum::<f32>() / 4.0;

    let inset = (w.min(h) / 4).max(edge + 1);
    let fill_ratio = ink_ratio(ink, x0 + inset, y0 + inset, x1.saturating_sub(inset), y1.saturating_sub(inset));

    let shape = if corner_ink < 0.15 {
        MarkShape::Round
    } else {
        MarkShape::Square
    };
    let outlined = match shape {
        MarkShape::Square => top.min(bottom).min(left).min(right) >= 0.5,
        MarkShape::Round => ring >= 0.25,
    };
    if !outlined {
        return None;
    }
    // A box that is solid all the way through is a blob, not a mark.
    if ring > 0.95 && fill_ratio > 0.95 && w > 2 * edge + 2 {
        return None;
    }

    let threshold = config.mark_fill_threshold.clamp(0.01, 0.99);
    let filled = fill_ratio >= threshold;
    let distance = if filled {
        (fill_ratio - threshold) / (1.0 - threshold)
    } else {
        (threshold - fill_ratio) / threshold
    };
    Some(Mark {
        bbox: *bbox,
        shape,
        filled,
        fill_ratio,
        clarity: (0.5 + distance / 2.0).clamp(0.0, 1.0),
    })
}

/// Find checkbox and radio marks on a page.
///
/// Components sitting mostly inside recognized text are ignored so that
/// letters such as `O` or `D` are not mistaken for marks.
pub fn find_marks(page: &Page, text_boxes: &[BoundingBox], config: &DetectionConfig) -> Vec<Mark> {
    let ink = binarize(&page.raster, config.ink_threshold);
    let min = config.mark_min_px as f32;
    let max = config.mark_max_px as f32;

    let mut marks: Vec<Mark> = outer_components(&ink)
        .into_iter()
        .filter(|b| b.width >= min && b.height >= min && b.width <= max && b.height <= max)
        .filter(|b| (b.aspect_ratio() - 1.0).abs() <= config.mark_square_tolerance)
        .filter(|b| !overlaps_text(b, text_boxes, 0.5))
        .filter_map(|b| classify_mark(&ink, &b, config))
        .collect();
    marks.sort_by(|a, b| {
        a.bbox
            .y
            .total_cmp(&b.bbox.y)
            .then_with(|| a.bbox.x.total_cmp(&b.bbox.x))
    });
    marks
}

/// Find probable signature regions on a page.
///
/// Ink under text blocks and marks is erased, the remaining strokes are
/// dilated so pen strokes of one signature join, and each resulting cluster
/// is kept when it is large enough, wider than tall and has the sparse ink
/// density of handwriting.
pub fn find_signature_regions(
    page: &Page,
    text_boxes: &[BoundingBox],
    marks: &[Mark],
    config: &DetectionConfig,
) -> Vec<SignatureRegion> {
    let mut ink = binarize(&page.raster, config.ink_threshold);
    for bbox in text_boxes.iter().chain(marks.iter().map(|m| &m.bbox)) {
        let (x0, y0, x1, y1) = pixel_rect(&bbox.inflate(2.0));
        for y in y0..y1.min(ink.height()) {
            for x in x0..x1.min(ink.width()) {
                ink.put_pixel(x, y, Luma([0]));
            }
        }
    }

    let merged = dilate(&ink, Norm::LInf, 4);
    let mut regions: Vec<SignatureRegion> = outer_components(&merged)
        .into_iter()
        .filter(|b| {
            b.width >= config.signature_min_width_px as f32
                && b.height >= config.signature_min_height_px as f32
                && b.aspect_ratio() >= 1.2
        })
        .filter_map(|b| {
            let (x0, y0, x1, y1) = pixel_rect(&b);
            let density = ink_ratio(&ink, x0, y0, x1, y1);
            let in_range = density >= config.signature_min_density
                && density <= config.signature_max_density;
            in_range.then_some(SignatureRegion { bbox: b, density })
        })
        .collect();
    regions.sort_by(|a, b| a.bbox.y.total_cmp(&b.bbox.y));
    regions
}
