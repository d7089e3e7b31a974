//! detection — candidate box sources
//!
//! Two interchangeable producers of raw candidate boxes:
//!
//! * [`OnnxDetector`] — a learned detector behind an ONNX session. Output
//!   rows are read as `[x1, y1, x2, y2, ...]` in pixel coordinates of the
//!   processing frame.
//! * [`ColorHeuristicDetector`] — an HSV band mask + connected components,
//!   used when no model artifact is configured. It keeps the pipeline
//!   demonstrable and testable without the learned model.
//!
//! Both emit [`RawBox`] — unclipped, possibly degenerate — so downstream
//! ranking treats them identically.

use anyhow::{Context, Result};
use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

use crate::depth::build_ort_session;
use crate::geometry::RawBox;
use crate::video::RgbFrame;

/// Smallest connected blob (in pixels) the color heuristic will report.
const MIN_BLOB_AREA: u32 = 500;
/// Yellow band on the OpenCV HSV scale (H in 0..180, S/V in 0..255).
const HUE_RANGE: (u8, u8) = (20, 30);
const SAT_MIN: u8 = 100;
const VAL_MIN: u8 = 100;

/// A source of candidate boxes for one frame.
///
/// Implementations may block (model inference) and may return zero boxes;
/// returned boxes are raw and must be clipped before use.
pub trait Detect {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<RawBox>>;
}

// ── OnnxDetector ─────────────────────────────────────────────────────────────

/// Wraps a learned detector ONNX session.
pub struct OnnxDetector {
    session: Session,
}

impl OnnxDetector {
    /// Load a detector ONNX model from `model_path`.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = build_ort_session(model_path.as_ref(), "failed to load detector ONNX model")?;
        Ok(Self { session })
    }

    fn preprocess(&self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        // NCHW float tensor at frame resolution, scaled to [0, 1].
        let size = (frame.width * frame.height) as usize;
        let raw = &frame.data;
        let mut tensor_data = vec![0f32; 3 * size];

        let (r_plane, gb_plane) = tensor_data.split_at_mut(size);
        let (g_plane, b_plane) = gb_plane.split_at_mut(size);
        rayon::join(
            || {
                r_plane
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(idx, out)| *out = raw[idx * 3] as f32 / 255.0)
            },
            || {
                rayon::join(
                    || {
                        g_plane
                            .par_iter_mut()
                            .enumerate()
                            .for_each(|(idx, out)| *out = raw[idx * 3 + 1] as f32 / 255.0)
                    },
                    || {
                        b_plane
                            .par_iter_mut()
                            .enumerate()
                            .for_each(|(idx, out)| *out = raw[idx * 3 + 2] as f32 / 255.0)
                    },
                )
            },
        );

        let shape = [1usize, 3, frame.height as usize, frame.width as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create detector input tensor")?
            .into_dyn())
    }
}

impl Detect for OnnxDetector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<RawBox>> {
        let input_tensor = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs!["input" => input_tensor])
            .context("detector inference failed")?;

        // First output: [N, C] with C >= 4, one row per candidate, the first
        // four columns being x1, y1, x2, y2 in frame pixels.
        let first_value = outputs
            .iter()
            .next()
            .context("detector produced no outputs")?
            .1;
        let (shape, data) = first_value
            .try_extract_tensor::<f32>()
            .context("failed to extract detector output tensor")?;

        // Tolerate a leading batch dimension of 1.
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        let dims = match dims.as_slice() {
            [1, rest @ ..] if rest.len() >= 2 => rest.to_vec(),
            other => other.to_vec(),
        };
        let (rows, cols) = match dims.as_slice() {
            [n, c] if *c >= 4 => (*n, *c),
            _ => anyhow::bail!("unsupported detector output shape {:?}", shape),
        };

        let mut boxes = Vec::with_capacity(rows);
        for row in 0..rows {
            let at = |col: usize| data[row * cols + col];
            boxes.push(RawBox::new(
                at(0) as i32,
                at(1) as i32,
                at(2) as i32,
                at(3) as i32,
            ));
        }

        debug!(candidates = boxes.len(), "detector inference complete");
        Ok(boxes)
    }
}

// ── ColorHeuristicDetector ───────────────────────────────────────────────────

/// Fallback detector: bounding rectangles of yellow blobs.
///
/// Mirrors the classic inRange → findContours → boundingRect chain: mask the
/// hue band, label 8-connected components, and report every component whose
/// pixel count clears [`MIN_BLOB_AREA`]. Boxes come out in raster order of
/// each component's first pixel, which keeps repeated runs on the same frame
/// identical.
pub struct ColorHeuristicDetector {
    min_area: u32,
}

impl ColorHeuristicDetector {
    pub fn new() -> Self {
        Self {
            min_area: MIN_BLOB_AREA,
        }
    }

    fn mask(&self, frame: &RgbFrame) -> GrayImage {
        let mut mask = GrayImage::new(frame.width, frame.height);
        for (i, px) in frame.data.chunks_exact(3).enumerate() {
            let (h, s, v) = rgb_to_hsv(px[0], px[1], px[2]);
            let hit = (HUE_RANGE.0..=HUE_RANGE.1).contains(&h) && s >= SAT_MIN && v >= VAL_MIN;
            if hit {
                let x = (i as u32) % frame.width;
                let y = (i as u32) / frame.width;
                mask.put_pixel(x, y, Luma([255u8]));
            }
        }
        mask
    }
}

impl Default for ColorHeuristicDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detect for ColorHeuristicDetector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<RawBox>> {
        let mask = self.mask(frame);
        let labeled = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

        // Per-label extents: label ids are assigned in raster order, so the
        // accumulation (and therefore box order) is deterministic.
        let mut extents: Vec<(u32, u32, u32, u32, u32)> = Vec::new(); // x1,y1,x2,y2,count
        for (x, y, label) in labeled.enumerate_pixels() {
            let id = label.0[0] as usize;
            if id == 0 {
                continue; // background
            }
            if extents.len() < id {
                extents.resize(id, (u32::MAX, u32::MAX, 0, 0, 0));
            }
            let e = &mut extents[id - 1];
            e.0 = e.0.min(x);
            e.1 = e.1.min(y);
            e.2 = e.2.max(x);
            e.3 = e.3.max(y);
            e.4 += 1;
        }

        let boxes: Vec<RawBox> = extents
            .into_iter()
            .filter(|e| e.4 > self.min_area)
            .map(|(x1, y1, x2, y2, _)| {
                RawBox::new(x1 as i32, y1 as i32, (x2 + 1) as i32, (y2 + 1) as i32)
            })
            .collect();

        debug!(blobs = boxes.len(), "color heuristic detection complete");
        Ok(boxes)
    }
}

/// RGB → HSV on the OpenCV scale: H in 0..=179 (degrees halved), S and V in
/// 0..=255.
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let rf = r as f32 / 255.0;
    let gf = g as f32 / 255.0;
    let bf = b as f32 / 255.0;

    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let hue_deg = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (((gf - bf) / delta).rem_euclid(6.0))
    } else if max == gf {
        60.0 * ((bf - rf) / delta + 2.0)
    } else {
        60.0 * ((rf - gf) / delta + 4.0)
    };

    let sat = if max == 0.0 { 0.0 } else { delta / max };

    let h = (hue_deg / 2.0).round().min(179.0) as u8;
    let s = (sat * 255.0).round() as u8;
    let v = (max * 255.0).round() as u8;
    (h, s, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_frame(w: u32, h: u32) -> RgbFrame {
        RgbFrame {
            data: vec![0u8; (w * h * 3) as usize],
            width: w,
            height: h,
            pts: 0,
        }
    }

    /// Strong yellow well inside the heuristic's band.
    const YELLOW: [u8; 3] = [255, 220, 0];

    fn paint_rect(frame: &mut RgbFrame, x1: u32, y1: u32, x2: u32, y2: u32, rgb: [u8; 3]) {
        for y in y1..y2 {
            for x in x1..x2 {
                let at = ((y * frame.width + x) * 3) as usize;
                frame.data[at..at + 3].copy_from_slice(&rgb);
            }
        }
    }

    #[test]
    fn hsv_conversion_matches_opencv_scale() {
        // Pure red: H 0, full saturation and value.
        assert_eq!(rgb_to_hsv(255, 0, 0), (0, 255, 255));
        // Pure yellow sits at 60° → 30 on the halved scale.
        assert_eq!(rgb_to_hsv(255, 255, 0), (30, 255, 255));
        // Gray has no saturation.
        let (_, s, v) = rgb_to_hsv(128, 128, 128);
        assert_eq!(s, 0);
        assert_eq!(v, 128);
    }

    #[test]
    fn yellow_blob_above_threshold_is_detected() {
        let mut frame = blank_frame(200, 200);
        // 30×30 = 900 px, comfortably above the 500 px floor.
        paint_rect(&mut frame, 50, 60, 80, 90, YELLOW);

        let mut det = ColorHeuristicDetector::new();
        let boxes = det.detect(&frame).unwrap();
        assert_eq!(boxes, vec![RawBox::new(50, 60, 80, 90)]);
    }

    #[test]
    fn small_blob_is_filtered_out() {
        let mut frame = blank_frame(200, 200);
        // 20×20 = 400 px, under the floor.
        paint_rect(&mut frame, 10, 10, 30, 30, YELLOW);

        let mut det = ColorHeuristicDetector::new();
        assert!(det.detect(&frame).unwrap().is_empty());
    }

    #[test]
    fn non_yellow_blob_is_ignored() {
        let mut frame = blank_frame(200, 200);
        paint_rect(&mut frame, 50, 50, 120, 120, [0, 0, 255]);

        let mut det = ColorHeuristicDetector::new();
        assert!(det.detect(&frame).unwrap().is_empty());
    }

    #[test]
    fn separate_blobs_produce_separate_boxes_in_raster_order() {
        let mut frame = blank_frame(300, 300);
        paint_rect(&mut frame, 200, 10, 240, 40, YELLOW);
        paint_rect(&mut frame, 20, 100, 60, 140, YELLOW);

        let mut det = ColorHeuristicDetector::new();
        let boxes = det.detect(&frame).unwrap();
        assert_eq!(
            boxes,
            vec![
                RawBox::new(200, 10, 240, 40),
                RawBox::new(20, 100, 60, 140),
            ]
        );
    }

    #[test]
    fn desaturated_yellow_is_rejected() {
        let mut frame = blank_frame(200, 200);
        // Washed-out yellow: hue is right but saturation falls below the band.
        paint_rect(&mut frame, 50, 50, 120, 120, [200, 190, 160]);

        let mut det = ColorHeuristicDetector::new();
        assert!(det.detect(&frame).unwrap().is_empty());
    }
}
