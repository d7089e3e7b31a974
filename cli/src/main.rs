use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use depthrank_core::{
    detection::{ColorHeuristicDetector, Detect, OnnxDetector},
    overlay::Overlay,
    pipeline::{Pipeline, DEFAULT_HEIGHT, DEFAULT_WIDTH},
    ranking::FrameResult,
    video::{FrameSource, RgbFrame, VideoReader, VideoWriter},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "depth-rank",
    version,
    about = "Rank detected objects nearest-first using monocular depth",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Full pipeline: rank detections by proximity, annotate, report FPS.
    Run {
        /// Input video: file, URL, or capture device
        #[arg(short, long)]
        input: PathBuf,

        /// MiDaS-small ONNX depth model path
        #[arg(long, default_value = "midas_small.onnx")]
        depth_model: PathBuf,

        /// Detector ONNX model path; omit to use the color heuristic fallback
        #[arg(long)]
        detector_model: Option<PathBuf>,

        /// Annotated output video path; omit to run headless (log-only)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Processing resolution width
        #[arg(long, default_value_t = DEFAULT_WIDTH)]
        width: u32,

        /// Processing resolution height
        #[arg(long, default_value_t = DEFAULT_HEIGHT)]
        height: u32,

        /// Label font file; well-known system locations are probed if omitted
        #[arg(long)]
        font: Option<PathBuf>,
    },

    /// Smoke-test a detector alone: draw raw candidate boxes, no ranking.
    Detect {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Detector ONNX model path; omit to exercise the color heuristic
        #[arg(long)]
        detector_model: Option<PathBuf>,

        /// Output video path
        #[arg(short, long, default_value = "detected.mp4")]
        output: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            depth_model,
            detector_model,
            output,
            width,
            height,
            font,
        } => cmd_run(input, depth_model, detector_model, output, width, height, font),
        Commands::Detect {
            input,
            detector_model,
            output,
        } => cmd_detect(input, detector_model, output),
    }
}

/// Install a Ctrl-C handler and return the flag it sets.
fn cancel_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(flag)
}

// ── Run: full proximity-ranking pipeline ─────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    input: PathBuf,
    depth_model: PathBuf,
    detector_model: Option<PathBuf>,
    output: Option<PathBuf>,
    width: u32,
    height: u32,
    font: Option<PathBuf>,
) -> Result<()> {
    info!("Proximity ranking pipeline");
    info!("  input       : {}", input.display());
    info!("  depth model : {}", depth_model.display());
    match &detector_model {
        Some(m) => info!("  detector    : {}", m.display()),
        None => info!("  detector    : color heuristic fallback"),
    }

    let mut pipeline = Pipeline::load(&depth_model, detector_model.as_ref(), width, height)
        .with_context(|| format!("failed to load models: {}", depth_model.display()))?;

    let mut reader = VideoReader::open(&input)
        .with_context(|| format!("failed to open input: {}", input.display()))?;

    let overlay = match font {
        Some(path) => Overlay::with_font(path)?,
        None => Overlay::new(),
    };

    let mut writer = match &output {
        Some(path) => Some(
            VideoWriter::create(path, reader.time_base(), reader.frame_rate())
                .with_context(|| format!("failed to create output: {}", path.display()))?,
        ),
        None => None,
    };

    let cancel = cancel_flag()?;
    let pb = spinner("Ranking detections…");
    let pb2 = pb.clone();

    let run_result = pipeline.run(
        &mut reader,
        |frame: &mut RgbFrame, result: &FrameResult| {
            pb2.tick();
            overlay.draw(frame, result, result.fps());
            if let Some(w) = writer.as_mut() {
                w.write(frame)?;
            }
            Ok(())
        },
        || cancel.load(Ordering::SeqCst),
    );

    // Finalize even when the run failed: the trailer makes the frames
    // encoded so far playable.
    if let Some(w) = writer {
        if let Err(e) = w.finish() {
            tracing::warn!("failed to finalize output: {e:#}");
        }
    }

    let frames = run_result?;
    pb.finish_with_message(format!("Done — {frames} frames processed."));
    Ok(())
}

// ── Detect: detector smoke test ──────────────────────────────────────────────

fn cmd_detect(input: PathBuf, detector_model: Option<PathBuf>, output: PathBuf) -> Result<()> {
    info!("Detector smoke test");

    let mut detector: Box<dyn Detect> = match &detector_model {
        Some(path) => Box::new(
            OnnxDetector::load(path)
                .with_context(|| format!("failed to load model: {}", path.display()))?,
        ),
        None => {
            info!("no detector model given; exercising the color heuristic");
            Box::new(ColorHeuristicDetector::new())
        }
    };

    let mut reader = VideoReader::open(&input)
        .with_context(|| format!("failed to open input: {}", input.display()))?;
    let mut writer = VideoWriter::create(&output, reader.time_base(), reader.frame_rate())?;

    let cancel = cancel_flag()?;
    let pb = spinner("Detecting…");

    let loop_result = (|| -> Result<()> {
        while let Some(mut frame) = reader.read_frame()? {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            pb.tick();
            match detector.detect(&frame) {
                Ok(boxes) => {
                    depthrank_core::overlay::draw_raw_boxes(&mut frame, &boxes, [0, 255, 0])
                }
                Err(e) => tracing::warn!("detection error: {e}"),
            }
            writer.write(&frame)?;
        }
        Ok(())
    })();

    if let Err(e) = writer.finish() {
        tracing::warn!("failed to finalize output: {e:#}");
    }

    loop_result?;
    pb.finish_with_message("Done.");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}
