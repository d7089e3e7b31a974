//! overlay — annotate ranked boxes onto a frame
//!
//! Rank 1 (nearest) is drawn green, everything else yellow, each with a
//! `#rank (score)` label and an FPS readout in the corner. Labels need a
//! TrueType font; when none can be found the overlay degrades to box-only
//! drawing rather than failing the pipeline.

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::geometry::{clip, RawBox};
use crate::ranking::FrameResult;
use crate::video::RgbFrame;

/// Box/label color for the nearest detection.
const NEAREST_COLOR: [u8; 3] = [0, 255, 0];
/// Box/label color for every other rank.
const OTHER_COLOR: [u8; 3] = [255, 255, 0];
/// FPS readout color.
const FPS_COLOR: [u8; 3] = [255, 255, 255];

const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_HEIGHT: i32 = 22;

/// Reusable overlay state (holds the label font, if one was found).
pub struct Overlay {
    font: Option<FontVec>,
}

impl Overlay {
    /// Build an overlay, probing well-known font locations for labels.
    pub fn new() -> Self {
        let font = font_candidates().into_iter().find_map(|p| {
            if p.is_file() {
                load_font(&p)
                    .map_err(|e| warn!(path = %p.display(), "skipping unusable font: {e}"))
                    .ok()
            } else {
                None
            }
        });
        if font.is_none() {
            warn!("no label font found; drawing boxes without text");
        }
        Self { font }
    }

    /// Build an overlay with an explicit font file.
    pub fn with_font<P: AsRef<Path>>(font_path: P) -> Result<Self> {
        let font = load_font(font_path.as_ref())?;
        info!(path = %font_path.as_ref().display(), "loaded label font");
        Ok(Self { font: Some(font) })
    }

    /// Draw `result` onto `frame` in-place, plus the FPS readout.
    pub fn draw(&self, frame: &mut RgbFrame, result: &FrameResult, fps: f64) {
        // Build the image over the existing buffer — no clone; written back below.
        let mut img: RgbImage =
            ImageBuffer::from_raw(frame.width, frame.height, std::mem::take(&mut frame.data))
                .expect("valid frame dimensions");

        for sb in &result.ranked {
            let color = if sb.rank == 1 {
                NEAREST_COLOR
            } else {
                OTHER_COLOR
            };
            let b = sb.bbox;

            // 2-px border: hollow rect plus a one-pixel inset.
            draw_hollow_rect_mut(
                &mut img,
                Rect::at(b.x1 as i32, b.y1 as i32).of_size(b.width(), b.height()),
                Rgb(color),
            );
            if b.width() > 2 && b.height() > 2 {
                draw_hollow_rect_mut(
                    &mut img,
                    Rect::at(b.x1 as i32 + 1, b.y1 as i32 + 1)
                        .of_size(b.width() - 2, b.height() - 2),
                    Rgb(color),
                );
            }

            if let Some(font) = &self.font {
                let label = format!("#{} ({:.1})", sb.rank, sb.depth_score);
                // Above the box when there is room, inside it otherwise.
                let y = (b.y1 as i32 - LABEL_HEIGHT).max(0);
                draw_text_mut(
                    &mut img,
                    Rgb(color),
                    b.x1 as i32,
                    y,
                    PxScale::from(LABEL_FONT_SIZE),
                    font,
                    &label,
                );
            }
        }

        if let Some(font) = &self.font {
            draw_text_mut(
                &mut img,
                Rgb(FPS_COLOR),
                10,
                10,
                PxScale::from(LABEL_FONT_SIZE),
                font,
                &format!("FPS: {fps:.1}"),
            );
        }

        frame.data = img.into_raw();
    }
}

impl Default for Overlay {
    fn default() -> Self {
        Self::new()
    }
}

/// Draw raw candidate boxes onto a frame in-place (detector smoke tests).
/// Out-of-bounds boxes are clipped; degenerate ones skipped.
pub fn draw_raw_boxes(frame: &mut RgbFrame, boxes: &[RawBox], color: [u8; 3]) {
    let (w, h) = (frame.width, frame.height);
    let mut img: RgbImage = ImageBuffer::from_raw(w, h, std::mem::take(&mut frame.data))
        .expect("valid frame dimensions");

    for &raw in boxes {
        if let Some(b) = clip(raw, w, h) {
            draw_hollow_rect_mut(
                &mut img,
                Rect::at(b.x1 as i32, b.y1 as i32).of_size(b.width(), b.height()),
                Rgb(color),
            );
        }
    }

    frame.data = img.into_raw();
}

fn load_font(path: &Path) -> Result<FontVec> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read font file {}", path.display()))?;
    FontVec::try_from_vec(bytes).context("failed to parse font file")
}

fn font_candidates() -> Vec<PathBuf> {
    [
        "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
        "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/TTF/DejaVuSans.ttf",
        "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
        "/Library/Fonts/Arial Unicode.ttf",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{clip, RawBox};
    use crate::ranking::ScoredBox;
    use std::time::Duration;

    fn frame(w: u32, h: u32) -> RgbFrame {
        RgbFrame {
            data: vec![0u8; (w * h * 3) as usize],
            width: w,
            height: h,
            pts: 0,
        }
    }

    fn result_with(boxes: &[(RawBox, f32, u32)]) -> FrameResult {
        FrameResult {
            ranked: boxes
                .iter()
                .map(|&(raw, depth_score, rank)| ScoredBox {
                    bbox: clip(raw, 100, 100).unwrap(),
                    depth_score,
                    rank,
                })
                .collect(),
            latency: Duration::from_millis(10),
        }
    }

    fn pixel(frame: &RgbFrame, x: u32, y: u32) -> [u8; 3] {
        let at = ((y * frame.width + x) * 3) as usize;
        [frame.data[at], frame.data[at + 1], frame.data[at + 2]]
    }

    #[test]
    fn rank_one_is_green_and_others_yellow() {
        let overlay = Overlay { font: None };
        let mut f = frame(100, 100);
        let result = result_with(&[
            (RawBox::new(10, 10, 30, 30), 9.0, 1),
            (RawBox::new(50, 50, 70, 70), 2.0, 2),
        ]);

        overlay.draw(&mut f, &result, 12.5);

        assert_eq!(pixel(&f, 10, 10), NEAREST_COLOR);
        assert_eq!(pixel(&f, 50, 50), OTHER_COLOR);
        // Interior stays untouched.
        assert_eq!(pixel(&f, 20, 20), [0, 0, 0]);
    }

    #[test]
    fn empty_result_leaves_frame_unchanged_without_font() {
        let overlay = Overlay { font: None };
        let mut f = frame(64, 64);
        let result = FrameResult {
            ranked: Vec::new(),
            latency: Duration::from_millis(5),
        };
        overlay.draw(&mut f, &result, 30.0);
        assert!(f.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn frame_buffer_survives_draw_roundtrip() {
        let overlay = Overlay { font: None };
        let mut f = frame(64, 64);
        let result = result_with(&[(RawBox::new(5, 5, 20, 20), 1.0, 1)]);
        overlay.draw(&mut f, &result, 1.0);
        assert_eq!(f.data.len(), 64 * 64 * 3);
    }
}
