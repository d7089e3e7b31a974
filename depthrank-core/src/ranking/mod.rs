//! ranking — nearest-first total ordering of candidate boxes
//!
//! Pure transformation chain: raw boxes → clipped boxes → scored boxes →
//! ranked result. Each stage drops what it cannot use (invalid geometry,
//! empty score regions) without error; an empty result is a normal outcome.

use std::time::Duration;

use tracing::debug;

use crate::depth::DepthMap;
use crate::geometry::{clip, BBox, RawBox};

/// A validated box with its proximity score and 1-based rank.
///
/// Rank 1 is the nearest box of the frame. Immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredBox {
    pub bbox: BBox,
    /// Median inverse-depth under the box: higher = nearer.
    pub depth_score: f32,
    pub rank: u32,
}

/// The core's sole per-frame output: ranked boxes plus processing latency.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameResult {
    /// Sorted by `depth_score` descending; ranks are 1..=len contiguous.
    pub ranked: Vec<ScoredBox>,
    /// Wall-clock time of the whole iteration that produced this result.
    pub latency: Duration,
}

impl FrameResult {
    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    /// Instantaneous rate derived from `latency`. Zero (not a division by
    /// zero) if the latency somehow measured as zero.
    pub fn fps(&self) -> f64 {
        let secs = self.latency.as_secs_f64();
        if secs > 0.0 {
            1.0 / secs
        } else {
            0.0
        }
    }
}

/// Clip, score, and totally order `raw_boxes` against `depth`.
///
/// Ties on `depth_score` keep the original detection order: the sort is
/// stable and the comparison key is the score alone, so identical inputs
/// always produce identical output — including tie order.
pub fn rank(depth: &DepthMap, raw_boxes: &[RawBox]) -> Vec<ScoredBox> {
    let mut scored: Vec<ScoredBox> = raw_boxes
        .iter()
        .filter_map(|&raw| clip(raw, depth.width(), depth.height()))
        .filter_map(|bbox| {
            depth.region_median(&bbox).map(|depth_score| ScoredBox {
                bbox,
                depth_score,
                rank: 0,
            })
        })
        .collect();

    // Nearest first: highest disparity wins. Stable sort; total_cmp gives a
    // total order even for NaN scores.
    scored.sort_by(|a, b| b.depth_score.total_cmp(&a.depth_score));

    for (i, s) in scored.iter_mut().enumerate() {
        s.rank = (i + 1) as u32;
    }

    debug!(
        candidates = raw_boxes.len(),
        ranked = scored.len(),
        "frame ranking complete"
    );
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_from(rows: &[&[f32]]) -> DepthMap {
        let h = rows.len() as u32;
        let w = rows[0].len() as u32;
        let data: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        DepthMap::from_vec(data, w, h).unwrap()
    }

    fn uniform_map(value: f32, w: u32, h: u32) -> DepthMap {
        DepthMap::from_vec(vec![value; (w * h) as usize], w, h).unwrap()
    }

    #[test]
    fn empty_input_yields_empty_result() {
        let depth = uniform_map(1.0, 100, 100);
        assert!(rank(&depth, &[]).is_empty());
    }

    #[test]
    fn nearer_box_outranks_farther_box() {
        // Left half near (200), right half far (50).
        let depth = DepthMap::from_vec(
            (0..100 * 100)
                .map(|i| if i % 100 < 50 { 200.0 } else { 50.0 })
                .collect(),
            100,
            100,
        )
        .unwrap();

        let far = RawBox::new(60, 10, 90, 40);
        let near = RawBox::new(10, 10, 40, 40);
        let ranked = rank(&depth, &[far, near]);

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[0].depth_score, 200.0);
        assert_eq!(ranked[0].bbox.x1, 10);
        assert_eq!(ranked[1].rank, 2);
        assert_eq!(ranked[1].depth_score, 50.0);
    }

    #[test]
    fn ranks_are_a_contiguous_permutation_and_scores_non_increasing() {
        let depth = map_from(&[
            &[9.0, 9.0, 1.0, 1.0, 5.0, 5.0],
            &[9.0, 9.0, 1.0, 1.0, 5.0, 5.0],
        ]);
        let boxes = [
            RawBox::new(2, 0, 4, 2),
            RawBox::new(0, 0, 2, 2),
            RawBox::new(4, 0, 6, 2),
        ];
        let ranked = rank(&depth, &boxes);

        let mut ranks: Vec<u32> = ranked.iter().map(|s| s.rank).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 2, 3]);
        for pair in ranked.windows(2) {
            assert!(pair[0].depth_score >= pair[1].depth_score);
        }
        assert_eq!(ranked[0].depth_score, 9.0);
        assert_eq!(ranked[2].depth_score, 1.0);
    }

    #[test]
    fn ties_keep_detection_order_and_runs_are_identical() {
        // Uniform field: both boxes score 10 → detection order decides.
        let depth = uniform_map(10.0, 100, 100);
        let boxes = [RawBox::new(0, 0, 10, 10), RawBox::new(20, 20, 30, 30)];

        let first = rank(&depth, &boxes);
        assert_eq!(first[0].bbox.x1, 0);
        assert_eq!(first[1].bbox.x1, 20);

        let second = rank(&depth, &boxes);
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_boxes_both_survive_with_distinct_ranks() {
        let depth = uniform_map(4.0, 50, 50);
        let b = RawBox::new(5, 5, 15, 15);
        let ranked = rank(&depth, &[b, b]);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].rank, 2);
        assert_eq!(ranked[0].bbox, ranked[1].bbox);
    }

    #[test]
    fn degenerate_and_outside_boxes_never_appear() {
        let depth = uniform_map(1.0, 100, 100);
        let boxes = [
            RawBox::new(5, 5, 5, 5),        // zero area
            RawBox::new(200, 200, 300, 300), // fully outside
            RawBox::new(10, 10, 20, 20),    // valid
        ];
        let ranked = rank(&depth, &boxes);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[0].bbox.x1, 10);
    }

    #[test]
    fn overhanging_box_is_scored_after_clipping() {
        let depth = uniform_map(3.0, 100, 100);
        let ranked = rank(&depth, &[RawBox::new(90, 90, 120, 120)]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].bbox.x2, 100);
        assert_eq!(ranked[0].bbox.y2, 100);
        assert_eq!(ranked[0].depth_score, 3.0);
    }

    #[test]
    fn fps_guards_zero_latency() {
        let r = FrameResult {
            ranked: Vec::new(),
            latency: Duration::ZERO,
        };
        assert_eq!(r.fps(), 0.0);

        let r = FrameResult {
            ranked: Vec::new(),
            latency: Duration::from_millis(50),
        };
        assert!((r.fps() - 20.0).abs() < 1e-9);
    }
}
