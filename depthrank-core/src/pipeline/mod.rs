//! pipeline — per-frame orchestration and the acquisition loop
//!
//! One synchronous stage chain per frame: resample → depth → detect → rank.
//! No iteration overlap, results delivered strictly in frame-arrival order,
//! and nothing mutable crosses an iteration boundary — each frame's depth map
//! and result are dropped before the next frame is pulled.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use fast_image_resize as fr;
use tracing::{info, warn};

use crate::depth::{DepthEstimator, EstimateDepth};
use crate::detection::{ColorHeuristicDetector, Detect, OnnxDetector};
use crate::ranking::{rank, FrameResult};
use crate::video::{resize_frame, FrameSource, RgbFrame};

/// Default processing resolution (constrained hardware runs smoother low-res).
pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;

/// The per-frame orchestrator: owns both collaborators and the processing
/// resolution, and turns one frame into one [`FrameResult`].
pub struct Pipeline {
    depth: Box<dyn EstimateDepth>,
    detector: Box<dyn Detect>,
    proc_width: u32,
    proc_height: u32,
    resizer: fr::Resizer,
    prof_frames: u64,
    prof_depth: Duration,
    prof_detect: Duration,
    prof_rank: Duration,
}

impl Pipeline {
    /// Assemble a pipeline from already-initialized collaborators.
    pub fn new(
        depth: Box<dyn EstimateDepth>,
        detector: Box<dyn Detect>,
        proc_width: u32,
        proc_height: u32,
    ) -> Self {
        Self {
            depth,
            detector,
            proc_width,
            proc_height,
            resizer: fr::Resizer::new(),
            prof_frames: 0,
            prof_depth: Duration::ZERO,
            prof_detect: Duration::ZERO,
            prof_rank: Duration::ZERO,
        }
    }

    /// Load models and assemble the pipeline. With no detector model the
    /// color heuristic stands in — designed degradation, not an error.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        depth_model: P,
        detector_model: Option<Q>,
        proc_width: u32,
        proc_height: u32,
    ) -> Result<Self> {
        let depth = DepthEstimator::load(depth_model)?;
        let detector: Box<dyn Detect> = match detector_model {
            Some(path) => Box::new(OnnxDetector::load(path)?),
            None => {
                info!("no detector model configured; using color heuristic fallback");
                Box::new(ColorHeuristicDetector::new())
            }
        };
        Ok(Self::new(
            Box::new(depth),
            detector,
            proc_width,
            proc_height,
        ))
    }

    pub fn proc_width(&self) -> u32 {
        self.proc_width
    }

    pub fn proc_height(&self) -> u32 {
        self.proc_height
    }

    /// Process one frame: resample to the processing resolution if needed,
    /// estimate depth, detect, rank. The frame is left at processing
    /// resolution so downstream annotation lines up with box coordinates.
    pub fn process(&mut self, frame: &mut RgbFrame) -> Result<FrameResult> {
        self.process_from(Instant::now(), frame)
    }

    /// Like [`process`](Self::process), but with the iteration start supplied
    /// by the caller. The latency stamped into the result must cover the whole
    /// iteration including frame acquisition, so [`run`](Self::run) takes its
    /// `Instant` before pulling the frame.
    fn process_from(&mut self, started: Instant, frame: &mut RgbFrame) -> Result<FrameResult> {
        if frame.width != self.proc_width || frame.height != self.proc_height {
            *frame = resize_frame(frame, self.proc_width, self.proc_height, &mut self.resizer)?;
        }

        let depth_start = Instant::now();
        let depth_map = self.depth.estimate(frame)?;
        self.prof_depth += depth_start.elapsed();

        let detect_start = Instant::now();
        let raw_boxes = self.detector.detect(frame)?;
        self.prof_detect += detect_start.elapsed();

        let rank_start = Instant::now();
        let ranked = rank(&depth_map, &raw_boxes);
        self.prof_rank += rank_start.elapsed();

        self.prof_frames += 1;
        if self.prof_frames > 0 && self.prof_frames % 300 == 0 {
            info!(
                frames = self.prof_frames,
                depth_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_depth.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                detect_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_detect.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                rank_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_rank.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                "pipeline stage timings"
            );
        }

        Ok(FrameResult {
            ranked,
            latency: started.elapsed(),
        })
    }

    /// Run the acquisition loop until end of stream, an acquisition failure,
    /// or cancellation. Returns the number of frames processed.
    ///
    /// `cancelled` is polled once per iteration — cancellation is cooperative
    /// and cannot preempt an in-flight inference call. An acquisition failure
    /// stops the loop cleanly (logged, not propagated); an inference fault
    /// propagates after its iteration, leaving no partial state behind.
    pub fn run<S, F, C>(&mut self, source: &mut S, mut sink: F, mut cancelled: C) -> Result<u64>
    where
        S: FrameSource,
        F: FnMut(&mut RgbFrame, &FrameResult) -> Result<()>,
        C: FnMut() -> bool,
    {
        let mut frames = 0u64;
        loop {
            if cancelled() {
                info!(frames, "cancellation requested; stopping");
                break;
            }

            // Acquisition counts toward the iteration's latency.
            let iteration_start = Instant::now();
            let mut frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!(frames, "end of stream");
                    break;
                }
                Err(e) => {
                    warn!(frames, "frame acquisition failed: {e:#}");
                    break;
                }
            };

            let result = self.process_from(iteration_start, &mut frame)?;
            sink(&mut frame, &result)?;
            frames += 1;
        }
        Ok(frames)
    }
}
