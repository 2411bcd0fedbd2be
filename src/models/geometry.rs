//! Axis-aligned page geometry.

use serde::{Deserialize, Serialize};

/// An axis-aligned bounding box in page pixel coordinates.
///
/// `x`/`y` is the top-left corner. Width and height are never negative;
/// constructors clamp them to zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    /// Creates a bounding box from two corners.
    pub fn from_coords(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let (left, right) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        let (top, bottom) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
        Self::new(left, top, right - left, bottom - top)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Width / height, or 0.0 for a degenerate box.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height <= 0.0 {
            0.0
        } else {
            self.width / self.height
        }
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x && x <= self.right() && y >= self.y && y <= self.bottom()
    }

    /// Area of the intersection with `other`. Returns 0.0 if they do not intersect.
    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if left >= right || top >= bottom {
            return 0.0;
        }
        (right - left) * (bottom - top)
    }

    /// Intersection over Union, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// Fraction of `self` covered by `other`.
    pub fn coverage_by(&self, other: &BoundingBox) -> f32 {
        let area = self.area();
        if area <= 0.0 {
            return 0.0;
        }
        self.intersection_area(other) / area
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::from_coords(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Horizontal distance from the right edge of `self` to the left edge of `other`.
    /// Negative when they overlap horizontally.
    pub fn horizontal_gap(&self, other: &BoundingBox) -> f32 {
        other.x - self.right()
    }

    /// Vertical distance from the bottom edge of `self` to the top edge of `other`.
    pub fn vertical_gap(&self, other: &BoundingBox) -> f32 {
        other.y - self.bottom()
    }

    /// Overlap of the vertical extents as a fraction of the shorter box.
    pub fn vertical_overlap_ratio(&self, other: &BoundingBox) -> f32 {
        let overlap = self.bottom().min(other.bottom()) - self.y.max(other.y);
        let shorter = self.height.min(other.height);
        if overlap <= 0.0 || shorter <= 0.0 {
            0.0
        } else {
            overlap / shorter
        }
    }

    /// Overlap of the horizontal extents as a fraction of the narrower box.
    pub fn horizontal_overlap_ratio(&self, other: &BoundingBox) -> f32 {
        let overlap = self.right().min(other.right()) - self.x.max(other.x);
        let narrower = self.width.min(other.width);
        if overlap <= 0.0 || narrower <= 0.0 {
            0.0
        } else {
            overlap / narrower
        }
    }

    /// Express the box as fractions of the page size.
    pub fn normalized(&self, page_width: u32, page_height: u32) -> BoundingBox {
        let w = page_width.max(1) as f32;
        let h = page_height.max(1) as f32;
        BoundingBox::new(self.x / w, self.y / h, self.width / w, self.height / h)
    }

    /// Inverse of [`normalized`](Self::normalized).
    pub fn denormalize(&self, page_width: u32, page_height: u32) -> BoundingBox {
        let w = page_width as f32;
        let h = page_height as f32;
        BoundingBox::new(self.x * w, self.y * h, self.width * w, self.height * h)
    }

    /// Grow (or shrink, for negative `margin`) on every side.
    pub fn inflate(&self, margin: f32) -> BoundingBox {
        BoundingBox::new(
            self.x - margin,
            self.y - margin,
            self.width + 2.0 * margin,
            self.height + 2.0 * margin,
        )
    }
}
