//! depth — monocular depth estimation + per-box proximity scoring
//!
//! Wraps a MiDaS-small-style ONNX model: 256×256 ImageNet-normalized input,
//! one dense disparity plane out. The output convention is inverse depth —
//! a **higher** value means **nearer** to the camera. The estimator resamples
//! its output back to the source frame size before returning, so a `DepthMap`
//! is always pixel-aligned with the frame it came from.

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

use crate::geometry::BBox;
use crate::video::RgbFrame;

/// Model input size (square).
const DEPTH_INPUT_SIZE: u32 = 256;
/// ImageNet normalization used by the MiDaS small transform.
const NORM_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const NORM_STD: [f32; 3] = [0.229, 0.224, 0.225];

// ── DepthMap ─────────────────────────────────────────────────────────────────

/// A dense grid of inverse-depth values aligned with one frame.
#[derive(Debug, Clone)]
pub struct DepthMap {
    data: Vec<f32>,
    width: u32,
    height: u32,
}

impl DepthMap {
    /// Build from a row-major plane. Fails if `data` does not cover `w × h`.
    pub fn from_vec(data: Vec<f32>, width: u32, height: u32) -> Result<Self> {
        anyhow::ensure!(
            data.len() == (width as usize) * (height as usize),
            "depth plane length {} does not match {}x{}",
            data.len(),
            width,
            height
        );
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Median inverse-depth of the region under `bbox`.
    ///
    /// Median, not mean: a detector box usually overlaps some background or
    /// occluding foreground, and the median ignores those outlier pixels.
    /// Returns `None` for an empty region — cannot happen for a box clipped
    /// against this map's dimensions, but checked anyway so a mismatched box
    /// degrades to exclusion rather than a panic.
    pub fn region_median(&self, bbox: &BBox) -> Option<f32> {
        if bbox.x2 > self.width || bbox.y2 > self.height {
            return None;
        }

        let mut values = Vec::with_capacity(bbox.area() as usize);
        for row in bbox.y1..bbox.y2 {
            let start = (row * self.width + bbox.x1) as usize;
            let end = (row * self.width + bbox.x2) as usize;
            values.extend_from_slice(&self.data[start..end]);
        }

        if values.is_empty() {
            return None;
        }

        values.sort_unstable_by(f32::total_cmp);
        let mid = values.len() / 2;
        if values.len() % 2 == 1 {
            Some(values[mid])
        } else {
            Some((values[mid - 1] + values[mid]) / 2.0)
        }
    }
}

// ── DepthEstimator ───────────────────────────────────────────────────────────

/// The depth collaborator: one dense disparity map per frame, sized to the
/// frame. Must not mutate its input.
pub trait EstimateDepth {
    fn estimate(&mut self, frame: &RgbFrame) -> Result<DepthMap>;
}

/// Wraps the MiDaS ONNX session plus reusable resize state.
pub struct DepthEstimator {
    session: Session,
    resizer: fr::Resizer,
    input_buf: Vec<u8>,
    output_resizer: fr::Resizer,
}

impl DepthEstimator {
    /// Load a MiDaS-small ONNX model from `model_path`.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = build_ort_session(model_path.as_ref(), "failed to load depth ONNX model")?;
        Ok(Self {
            session,
            resizer: fr::Resizer::new(),
            input_buf: vec![0u8; (DEPTH_INPUT_SIZE * DEPTH_INPUT_SIZE * 3) as usize],
            output_resizer: fr::Resizer::new(),
        })
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create depth resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            DEPTH_INPUT_SIZE,
            DEPTH_INPUT_SIZE,
            std::mem::take(&mut self.input_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create depth resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("depth input resize failed")?;

        self.input_buf = dst.into_vec();
        let raw = &self.input_buf;

        // NCHW float tensor: [1, 3, 256, 256], ImageNet-normalized.
        let size = (DEPTH_INPUT_SIZE * DEPTH_INPUT_SIZE) as usize;
        let mut tensor_data = vec![0f32; 3 * size];

        let (r_plane, gb_plane) = tensor_data.split_at_mut(size);
        let (g_plane, b_plane) = gb_plane.split_at_mut(size);
        rayon::join(
            || {
                r_plane.par_iter_mut().enumerate().for_each(|(idx, out)| {
                    *out = (raw[idx * 3] as f32 / 255.0 - NORM_MEAN[0]) / NORM_STD[0]
                })
            },
            || {
                rayon::join(
                    || {
                        g_plane.par_iter_mut().enumerate().for_each(|(idx, out)| {
                            *out = (raw[idx * 3 + 1] as f32 / 255.0 - NORM_MEAN[1]) / NORM_STD[1]
                        })
                    },
                    || {
                        b_plane.par_iter_mut().enumerate().for_each(|(idx, out)| {
                            *out = (raw[idx * 3 + 2] as f32 / 255.0 - NORM_MEAN[2]) / NORM_STD[2]
                        })
                    },
                )
            },
        );

        let shape = [
            1usize,
            3,
            DEPTH_INPUT_SIZE as usize,
            DEPTH_INPUT_SIZE as usize,
        ];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create depth input tensor")?
            .into_dyn())
    }
}

impl EstimateDepth for DepthEstimator {
    /// Run depth inference on `frame` and return a disparity map resampled to
    /// the frame's own dimensions.
    fn estimate(&mut self, frame: &RgbFrame) -> Result<DepthMap> {
        let input_tensor = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs!["input" => input_tensor])
            .context("depth inference failed")?;

        // First (only) output: [1, 256, 256] disparity plane.
        let first_value = outputs
            .iter()
            .next()
            .context("depth model produced no outputs")?
            .1;
        let (_shape, data) = first_value
            .try_extract_tensor::<f32>()
            .context("failed to extract depth output tensor")?;

        let expected = (DEPTH_INPUT_SIZE * DEPTH_INPUT_SIZE) as usize;
        anyhow::ensure!(
            data.len() == expected,
            "unexpected depth output length {} (want {})",
            data.len(),
            expected
        );

        debug!(
            frame_w = frame.width,
            frame_h = frame.height,
            "resampling depth output to frame size"
        );
        let plane = resample_plane(
            &mut self.output_resizer,
            data,
            DEPTH_INPUT_SIZE,
            DEPTH_INPUT_SIZE,
            frame.width,
            frame.height,
        )?;

        DepthMap::from_vec(plane, frame.width, frame.height)
    }
}

/// Resample a single-channel f32 plane to `out_w × out_h` (cubic filter, so a
/// coarse 256×256 model output upsamples smoothly to frame resolution).
fn resample_plane(
    resizer: &mut fr::Resizer,
    plane: &[f32],
    in_w: u32,
    in_h: u32,
    out_w: u32,
    out_h: u32,
) -> Result<Vec<f32>> {
    if in_w == out_w && in_h == out_h {
        return Ok(plane.to_vec());
    }

    let src = fr::images::ImageRef::new(in_w, in_h, bytemuck::cast_slice(plane), fr::PixelType::F32)
        .context("failed to create depth plane source")?;

    let mut dst = fr::images::Image::from_vec_u8(
        out_w,
        out_h,
        vec![0u8; (out_w as usize) * (out_h as usize) * 4],
        fr::PixelType::F32,
    )
    .context("failed to create depth plane destination")?;

    let options =
        fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::CatmullRom));
    resizer
        .resize(&src, &mut dst, Some(&options))
        .context("depth plane resample failed")?;

    Ok(bytemuck::pod_collect_to_vec(dst.buffer()))
}

pub(crate) fn build_ort_session(model_path: &Path, load_error: &'static str) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(1)
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_inter_threads(1)
        .context("failed to set ORT inter threads")?;
    builder = builder
        .with_parallel_execution(false)
        .context("failed to set ORT parallel execution")?;
    builder.commit_from_file(model_path).context(load_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{clip, RawBox};

    fn uniform_map(value: f32, w: u32, h: u32) -> DepthMap {
        DepthMap::from_vec(vec![value; (w * h) as usize], w, h).unwrap()
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        assert!(DepthMap::from_vec(vec![0.0; 10], 4, 4).is_err());
    }

    #[test]
    fn uniform_region_scores_the_uniform_value() {
        let map = uniform_map(10.0, 100, 100);
        let b = clip(RawBox::new(0, 0, 10, 10), 100, 100).unwrap();
        assert_eq!(map.region_median(&b), Some(10.0));
    }

    #[test]
    fn median_ignores_a_single_outlier() {
        // 10×10 region of 50.0 with one extreme pixel; the mean would move,
        // the median must not.
        let mut data = vec![50.0f32; 100 * 100];
        data[5 * 100 + 5] = 10_000.0;
        let map = DepthMap::from_vec(data, 100, 100).unwrap();
        let b = clip(RawBox::new(0, 0, 10, 10), 100, 100).unwrap();
        assert_eq!(map.region_median(&b), Some(50.0));
    }

    #[test]
    fn even_count_median_averages_the_middle_pair() {
        // 2×1 region holding [1.0, 3.0] → 2.0
        let map = DepthMap::from_vec(vec![1.0, 3.0], 2, 1).unwrap();
        let b = clip(RawBox::new(0, 0, 2, 1), 2, 1).unwrap();
        assert_eq!(map.region_median(&b), Some(2.0));
    }

    #[test]
    fn box_outside_map_dimensions_is_excluded() {
        // A box clipped against a larger frame than the map covers.
        let map = uniform_map(1.0, 50, 50);
        let b = clip(RawBox::new(40, 40, 80, 80), 100, 100).unwrap();
        assert_eq!(map.region_median(&b), None);
    }

    #[test]
    fn region_at_frame_edge_scores_normally() {
        let map = uniform_map(7.5, 100, 100);
        let b = clip(RawBox::new(90, 90, 120, 120), 100, 100).unwrap();
        assert_eq!(map.region_median(&b), Some(7.5));
    }

    #[test]
    fn resample_plane_is_identity_at_matching_size() {
        let mut resizer = fr::Resizer::new();
        let plane = vec![1.0f32, 2.0, 3.0, 4.0];
        let out = resample_plane(&mut resizer, &plane, 2, 2, 2, 2).unwrap();
        assert_eq!(out, plane);
    }

    #[test]
    fn resample_plane_produces_exact_output_dimensions() {
        let mut resizer = fr::Resizer::new();
        let plane = vec![3.0f32; 16 * 16];
        let out = resample_plane(&mut resizer, &plane, 16, 16, 40, 30).unwrap();
        assert_eq!(out.len(), 40 * 30);
        // A constant plane must stay constant under resampling.
        for v in out {
            assert!((v - 3.0).abs() < 1e-3);
        }
    }
}
