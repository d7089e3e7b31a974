//! geometry — bounding-box clipping and validation
//!
//! Detector output is noise-prone: negative coordinates, boxes that hang off
//! the frame edge, zero-area rectangles. [`clip`] is the single gate that
//! turns a raw detection into a box the rest of the pipeline can trust.

/// An unvalidated axis-aligned rectangle straight from a detector.
///
/// Coordinates may be negative, out of frame bounds, or degenerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl RawBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

/// A validated axis-aligned rectangle in frame pixel coordinates.
///
/// Invariant: `x1 < x2 <= frame width` and `y1 < y2 <= frame height` for the
/// frame it was clipped against. Only [`clip`] constructs these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BBox {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

/// Clamp `raw` into `[0, w] × [0, h]` and validate the result.
///
/// Returns `None` when the clamped rectangle has no area (degenerate or
/// entirely outside the frame). Never panics; callers filter `None` out and
/// move on — malformed boxes are expected input, not errors.
pub fn clip(raw: RawBox, w: u32, h: u32) -> Option<BBox> {
    let x1 = raw.x1.clamp(0, w as i32) as u32;
    let y1 = raw.y1.clamp(0, h as i32) as u32;
    let x2 = raw.x2.clamp(0, w as i32) as u32;
    let y2 = raw.y2.clamp(0, h as i32) as u32;

    if x2 > x1 && y2 > y1 {
        Some(BBox { x1, y1, x2, y2 })
    } else {
        None
    }
}
