//! video — FFmpeg bridge
//!
//! Frame acquisition and annotated output. [`VideoReader`] opens a file, URL,
//! or capture device and yields decoded RGB24 frames one at a time, which is
//! what lets the pipeline own its loop (and poll for cancellation between
//! frames) instead of handing control to a transcode callback. [`VideoWriter`]
//! encodes annotated frames back to H.264, deferring encoder setup until the
//! first frame so it picks up whatever dimensions the pipeline settled on.

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, encoder, format, frame, media, software::scaling, util::rational::Rational,
};
use std::path::Path;
use tracing::{debug, info};

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Scaling flags — bilinear is fast and good enough for the decode path.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// A single decoded video frame in RGB24 format, along with its presentation
/// timestamp (in the source stream's time-base units).
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

/// The camera collaborator boundary: anything that yields frames until the
/// stream ends. `Ok(None)` is a clean end of stream; `Err` is an acquisition
/// failure. The call may block — that is the pipeline's one expected blocking
/// point besides model inference.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Option<RgbFrame>>;
}

// ── VideoReader ──────────────────────────────────────────────────────────────

/// Decodes one video stream to RGB24 frames on demand.
pub struct VideoReader {
    ictx: format::context::Input,
    decoder: ffmpeg::decoder::Video,
    to_rgb: scaling::Context,
    stream_index: usize,
    time_base: Rational,
    frame_rate: Rational,
    width: u32,
    height: u32,
    decoded: frame::Video,
    rgb: frame::Video,
    frame_count: u64,
    eof_sent: bool,
}

impl VideoReader {
    /// Open `input_path` and prepare the best video stream for decoding.
    pub fn open<P: AsRef<Path>>(input_path: P) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let ictx = format::input(&input_path).context("could not open video input")?;

        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let frame_rate = stream.avg_frame_rate();

        let decoder_ctx = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();
        let pixel_fmt = decoder.format();

        info!(width, height, ?pixel_fmt, "opened video input");

        let to_rgb = scaling::Context::get(
            pixel_fmt,
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        Ok(Self {
            ictx,
            decoder,
            to_rgb,
            stream_index,
            time_base,
            frame_rate,
            width,
            height,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            frame_count: 0,
            eof_sent: false,
        })
    }

    /// Source stream time base (needed to mux annotated frames back out).
    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn frame_rate(&self) -> Rational {
        self.frame_rate
    }

    fn convert_decoded(&mut self) -> Result<RgbFrame> {
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let stride = self.rgb.stride(0);
        let raw = self.rgb.data(0);
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for row in 0..self.height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + self.width as usize * 3]);
        }

        let pts = self.decoded.pts().unwrap_or(self.frame_count as i64);
        self.frame_count += 1;
        if self.frame_count % 100 == 0 {
            debug!(frames = self.frame_count, "decoded frames");
        }

        Ok(RgbFrame {
            data,
            width: self.width,
            height: self.height,
            pts,
        })
    }
}

impl FrameSource for VideoReader {
    /// Decode the next frame. `Ok(None)` signals a clean end of stream; an
    /// `Err` is an acquisition failure.
    fn read_frame(&mut self) -> Result<Option<RgbFrame>> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return Ok(Some(self.convert_decoded()?));
            }
            if self.eof_sent {
                return Ok(None);
            }

            // Pull the next packet of our stream; demuxer EOF flushes the
            // decoder so trailing frames still drain above.
            match self.ictx.packets().next() {
                Some((stream, packet)) if stream.index() == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .context("decoder send_packet failed")?;
                }
                Some(_) => {}
                None => {
                    self.decoder.send_eof().ok();
                    self.eof_sent = true;
                }
            }
        }
    }
}

// ── VideoWriter ──────────────────────────────────────────────────────────────

struct EncoderState {
    video_encoder: encoder::Video,
    to_yuv: scaling::Context,
    out_rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    width: u32,
    height: u32,
}

/// Encodes RGB24 frames to an H.264 file.
///
/// Encoder and muxer setup is deferred to the first [`write`](Self::write) so
/// the output picks up the annotated frames' actual dimensions.
pub struct VideoWriter {
    octx: format::context::Output,
    state: Option<EncoderState>,
    time_base: Rational,
    frame_rate: Rational,
    frame_count: u64,
}

impl VideoWriter {
    /// Create an output container at `output_path`. `time_base` and
    /// `frame_rate` usually come straight from the [`VideoReader`].
    pub fn create<P: AsRef<Path>>(
        output_path: P,
        time_base: Rational,
        frame_rate: Rational,
    ) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;
        let octx = format::output(&output_path).context("could not create output context")?;
        Ok(Self {
            octx,
            state: None,
            time_base,
            frame_rate,
            frame_count: 0,
        })
    }

    /// Encode one frame. The first call fixes the output dimensions.
    pub fn write(&mut self, rgb: &RgbFrame) -> Result<()> {
        if self.state.is_none() {
            self.init_encoder(rgb.width, rgb.height)?;
        }
        let state = self.state.as_mut().expect("encoder initialised above");

        anyhow::ensure!(
            rgb.width == state.width && rgb.height == state.height,
            "frame size {}x{} does not match encoder {}x{}",
            rgb.width,
            rgb.height,
            state.width,
            state.height
        );

        // Write the RGB data into the output AVFrame, honoring its stride.
        let out_stride = state.out_rgb_frame.stride(0);
        let plane_data = state.out_rgb_frame.data_mut(0);
        for row in 0..state.height as usize {
            let dst_start = row * out_stride;
            let src_start = row * state.width as usize * 3;
            plane_data[dst_start..dst_start + state.width as usize * 3]
                .copy_from_slice(&rgb.data[src_start..src_start + state.width as usize * 3]);
        }

        state
            .to_yuv
            .run(&state.out_rgb_frame, &mut state.yuv_frame)
            .context("to-YUV scaling failed")?;

        state.yuv_frame.set_pts(Some(rgb.pts));

        state
            .video_encoder
            .send_frame(&state.yuv_frame)
            .context("encoder send_frame failed")?;

        flush_encoder(
            &mut state.video_encoder,
            &mut self.octx,
            state.stream_index,
            self.time_base,
        )?;

        self.frame_count += 1;
        Ok(())
    }

    fn init_encoder(&mut self, width: u32, height: u32) -> Result<()> {
        let global_header = self
            .octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found — is FFmpeg built with libx264?")?;

        let mut out_stream = self.octx.add_stream(encoder_codec)?;
        let encoder_ctx = codec::context::Context::new_with_codec(encoder_codec);
        let mut builder = encoder_ctx.encoder().video()?;

        builder.set_width(width);
        builder.set_height(height);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(self.time_base);
        builder.set_frame_rate(Some(self.frame_rate));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let video_encoder = builder
            .open_as_with(
                encoder_codec,
                ffmpeg::Dictionary::from_iter([("crf", "18"), ("preset", "fast")]),
            )
            .context("failed to open H.264 encoder")?;

        out_stream.set_parameters(&video_encoder);
        let stream_index = out_stream.index();

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            width,
            height,
            ENCODE_FORMAT,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        info!(width, height, "output dimensions determined; writing header");
        self.octx
            .write_header()
            .context("failed to write output header")?;

        self.state = Some(EncoderState {
            video_encoder,
            to_yuv,
            out_rgb_frame: frame::Video::new(format::Pixel::RGB24, width, height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            width,
            height,
        });
        Ok(())
    }

    /// Flush the encoder and finalize the container.
    pub fn finish(mut self) -> Result<()> {
        if let Some(state) = self.state.as_mut() {
            state.video_encoder.send_eof().ok();
            flush_encoder(
                &mut state.video_encoder,
                &mut self.octx,
                state.stream_index,
                self.time_base,
            )?;
            self.octx
                .write_trailer()
                .context("failed to write output trailer")?;
            info!(frames = self.frame_count, "annotated output finalized");
        }
        Ok(())
    }
}

/// Drain all pending packets from the encoder and write them to the muxer.
fn flush_encoder(
    encoder: &mut encoder::Video,
    octx: &mut format::context::Output,
    stream_index: usize,
    time_base: Rational,
) -> Result<()> {
    let mut encoded = ffmpeg::Packet::empty();
    while encoder.receive_packet(&mut encoded).is_ok() {
        encoded.set_stream(stream_index);
        let ost_time_base = octx
            .stream(stream_index)
            .context("output stream disappeared")?
            .time_base();
        encoded.rescale_ts(time_base, ost_time_base);
        encoded
            .write_interleaved(octx)
            .context("failed to write encoded packet")?;
    }
    Ok(())
}

// ── Resampling ───────────────────────────────────────────────────────────────

/// Resample `frame` to exactly `out_w × out_h` (bilinear). Box coordinates
/// downstream are expressed in this resolution, so the output dimensions must
/// match precisely.
pub fn resize_frame(
    frame: &RgbFrame,
    out_w: u32,
    out_h: u32,
    resizer: &mut fr::Resizer,
) -> Result<RgbFrame> {
    let src = fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
        .context("failed to create frame resize source")?;

    let mut dst = fr::images::Image::from_vec_u8(
        out_w,
        out_h,
        vec![0u8; (out_w as usize) * (out_h as usize) * 3],
        fr::PixelType::U8x3,
    )
    .context("failed to create frame resize destination")?;

    let options =
        fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
    resizer
        .resize(&src, &mut dst, Some(&options))
        .context("frame resize failed")?;

    Ok(RgbFrame {
        data: dst.into_vec(),
        width: out_w,
        height: out_h,
        pts: frame.pts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_frame_hits_exact_target_dimensions() {
        let frame = RgbFrame {
            data: vec![128u8; 64 * 48 * 3],
            width: 64,
            height: 48,
            pts: 7,
        };
        let mut resizer = fr::Resizer::new();
        let out = resize_frame(&frame, 40, 30, &mut resizer).unwrap();
        assert_eq!(out.width, 40);
        assert_eq!(out.height, 30);
        assert_eq!(out.data.len(), 40 * 30 * 3);
        assert_eq!(out.pts, 7);
    }

    #[test]
    fn resize_frame_preserves_a_constant_image() {
        let frame = RgbFrame {
            data: vec![200u8; 32 * 32 * 3],
            width: 32,
            height: 32,
            pts: 0,
        };
        let mut resizer = fr::Resizer::new();
        let out = resize_frame(&frame, 64, 64, &mut resizer).unwrap();
        assert!(out.data.iter().all(|&b| b == 200));
    }
}
