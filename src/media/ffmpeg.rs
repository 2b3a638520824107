//! FFmpeg video reader and writer.
//!
//! Frames are decoded in-memory to RGB24 at the stream's native resolution and
//! re-encoded as MPEG-4 Part 2 (the `mp4v` codec) at the input frame rate.
//! The container is chosen by FFmpeg from the output extension.

use std::path::Path;

use anyhow::Context;
use ffmpeg_next as ffmpeg;
use image::RgbImage;

use super::{FrameReader, FrameWriter, VideoBackend, VideoParams};
use crate::error::{PipelineError, PipelineResult};

const FALLBACK_FPS: f64 = 25.0;

pub struct FfmpegVideoBackend;

impl FfmpegVideoBackend {
    pub fn new() -> anyhow::Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        Ok(Self)
    }
}

impl VideoBackend for FfmpegVideoBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open_reader(&self, path: &Path) -> PipelineResult<Box<dyn FrameReader>> {
        Ok(Box::new(FfmpegFrameReader::open(path)?))
    }

    fn open_writer(&self, path: &Path, params: VideoParams) -> PipelineResult<Box<dyn FrameWriter>> {
        Ok(Box::new(FfmpegFrameWriter::create(path, params)?))
    }
}

// ----------------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------------

struct FfmpegFrameReader {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    params: VideoParams,
    eof_sent: bool,
}

impl FfmpegFrameReader {
    fn open(path: &Path) -> PipelineResult<Self> {
        let open_err = |err: ffmpeg::Error| {
            PipelineError::Io(format!("failed to open video {}: {}", path.display(), err))
        };
        let input = ffmpeg::format::input(&path).map_err(open_err)?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| PipelineError::Io(format!("{} has no video track", path.display())))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
            f64::from(rate)
        } else {
            FALLBACK_FPS
        };
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .map_err(open_err)?;
        let decoder = context.decoder().video().map_err(open_err)?;

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(open_err)?;

        let params = VideoParams {
            width: decoder.width(),
            height: decoder.height(),
            fps,
        };
        log::debug!(
            "ffmpeg reader opened {} ({}x{} @ {:.2} fps)",
            path.display(),
            params.width,
            params.height,
            params.fps
        );

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            params,
            eof_sent: false,
        })
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> PipelineResult<RgbImage> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .map_err(|err| PipelineError::Io(format!("scale frame to RGB: {}", err)))?;
        frame_to_image(&rgb_frame)
    }
}

impl FrameReader for FfmpegFrameReader {
    fn params(&self) -> VideoParams {
        self.params
    }

    fn next_frame(&mut self) -> Option<PipelineResult<RgbImage>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return Some(self.convert(&decoded));
            }
            if self.eof_sent {
                return None;
            }

            let stream_index = self.stream_index;
            let packet = self
                .input
                .packets()
                .find_map(|(stream, packet)| (stream.index() == stream_index).then_some(packet));
            match packet {
                Some(packet) => {
                    if let Err(err) = self.decoder.send_packet(&packet) {
                        return Some(Err(PipelineError::Io(format!(
                            "decode video packet: {}",
                            err
                        ))));
                    }
                }
                None => {
                    self.eof_sent = true;
                    if let Err(err) = self.decoder.send_eof() {
                        log::debug!("ffmpeg decoder flush failed: {}", err);
                        return None;
                    }
                }
            }
        }
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> PipelineResult<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .ok_or_else(|| PipelineError::io("ffmpeg frame row is out of bounds"))?,
        );
    }

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| PipelineError::io("decoded frame has inconsistent dimensions"))
}

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

struct FfmpegFrameWriter {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    params: VideoParams,
    next_pts: i64,
}

impl FfmpegFrameWriter {
    fn create(path: &Path, params: VideoParams) -> PipelineResult<Self> {
        let enc_err = |err: ffmpeg::Error| {
            PipelineError::Encoding(format!("failed to create {}: {}", path.display(), err))
        };
        let mut output = ffmpeg::format::output(&path).map_err(enc_err)?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| PipelineError::encoding("mpeg4 encoder not available"))?;
        let mut stream = output.add_stream(codec).map_err(enc_err)?;
        let stream_index = stream.index();

        let frame_rate = ffmpeg::Rational::from(params.fps);
        let encoder_time_base = frame_rate.invert();
        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(enc_err)?;
        encoder.set_width(params.width);
        encoder.set_height(params.height);
        encoder.set_format(ffmpeg::format::Pixel::YUV420P);
        encoder.set_frame_rate(Some(frame_rate));
        encoder.set_time_base(encoder_time_base);
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder.open_as(codec).map_err(enc_err)?;
        stream.set_parameters(&encoder);
        stream.set_time_base(encoder_time_base);

        output.write_header().map_err(enc_err)?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .unwrap_or(encoder_time_base);

        let scaler = ffmpeg::software::scaling::Context::get(
            ffmpeg::format::Pixel::RGB24,
            params.width,
            params.height,
            ffmpeg::format::Pixel::YUV420P,
            params.width,
            params.height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(enc_err)?;

        Ok(Self {
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base,
            stream_time_base,
            params,
            next_pts: 0,
        })
    }

    fn drain_packets(&mut self) -> PipelineResult<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .map_err(|err| PipelineError::Encoding(format!("write packet: {}", err)))?;
        }
        Ok(())
    }
}

impl FrameWriter for FfmpegFrameWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()> {
        if frame.dimensions() != (self.params.width, self.params.height) {
            return Err(PipelineError::Encoding(format!(
                "frame size {}x{} does not match output {}x{}",
                frame.width(),
                frame.height(),
                self.params.width,
                self.params.height
            )));
        }

        let mut rgb = ffmpeg::frame::Video::new(
            ffmpeg::format::Pixel::RGB24,
            self.params.width,
            self.params.height,
        );
        let row_bytes = self.params.width as usize * 3;
        let stride = rgb.stride(0);
        let data = rgb.data_mut(0);
        for (row, chunk) in frame.as_raw().chunks_exact(row_bytes).enumerate() {
            data[row * stride..row * stride + row_bytes].copy_from_slice(chunk);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&rgb, &mut yuv)
            .map_err(|err| PipelineError::Encoding(format!("convert frame to YUV: {}", err)))?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&yuv)
            .map_err(|err| PipelineError::Encoding(format!("encode frame: {}", err)))?;
        self.drain_packets()
    }

    fn finish(mut self: Box<Self>) -> PipelineResult<()> {
        self.encoder
            .send_eof()
            .map_err(|err| PipelineError::Encoding(format!("flush encoder: {}", err)))?;
        self.drain_packets()?;
        self.output
            .write_trailer()
            .map_err(|err| PipelineError::Encoding(format!("write trailer: {}", err)))
    }
}
