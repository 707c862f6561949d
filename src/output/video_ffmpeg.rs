//! Video file output using FFmpeg.
//!
//! The encoder is configured lazily from the first frame. Odd dimensions are
//! cropped to even for YUV 4:2:0.

use std::path::{Path, PathBuf};

use ffmpeg_next as ffmpeg;
use ffmpeg::util::format::pixel::Pixel;

use super::FrameSink;
use crate::error::SinkError;
use crate::frame::Frame;

struct Encoding {
    octx: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    width: u32,
    height: u32,
    next_pts: i64,
}

pub struct FfmpegVideoSink {
    path: PathBuf,
    fps: i32,
    encoding: Option<Encoding>,
    finished: bool,
}

fn encoder_err(what: &str, err: impl std::fmt::Display) -> SinkError {
    SinkError::Encoder(format!("{}: {}", what, err))
}

impl FfmpegVideoSink {
    pub fn create(path: &Path, fps: f64) -> Result<Self, SinkError> {
        ffmpeg::init().map_err(|e| encoder_err("initialize ffmpeg", e))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let fps = if fps.is_finite() && fps >= 1.0 {
            fps.round() as i32
        } else {
            super::DEFAULT_OUTPUT_FPS as i32
        };
        Ok(Self {
            path: path.to_path_buf(),
            fps,
            encoding: None,
            finished: false,
        })
    }

    fn start(&self, frame: &Frame) -> Result<Encoding, SinkError> {
        let width = frame.width() & !1;
        let height = frame.height() & !1;
        if width == 0 || height == 0 {
            return Err(SinkError::Encoder("frame too small to encode".into()));
        }
        let mut octx = ffmpeg::format::output(&self.path)
            .map_err(|e| encoder_err("open output", e))?;
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::H264)
            .or_else(|| ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4))
            .ok_or_else(|| SinkError::Encoder("no H.264 or MPEG-4 encoder available".into()))?;
        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let mut stream = octx
            .add_stream(codec)
            .map_err(|e| encoder_err("add stream", e))?;
        let stream_index = stream.index();
        let time_base = ffmpeg::Rational::new(1, self.fps);

        let mut config = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| encoder_err("create encoder", e))?;
        config.set_width(width);
        config.set_height(height);
        config.set_format(Pixel::YUV420P);
        config.set_time_base(time_base);
        config.set_frame_rate(Some(ffmpeg::Rational::new(self.fps, 1)));
        if global_header {
            config.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = config
            .open_as(codec)
            .map_err(|e| encoder_err("open encoder", e))?;
        stream.set_parameters(&encoder);
        stream.set_time_base(time_base);

        octx.write_header().map_err(|e| encoder_err("write header", e))?;
        let stream_time_base = octx
            .stream(stream_index)
            .map(|s| s.time_base())
            .unwrap_or(time_base);

        let scaler = ffmpeg::software::scaling::context::Context::get(
            Pixel::RGB24,
            width,
            height,
            Pixel::YUV420P,
            width,
            height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| encoder_err("create scaler", e))?;

        log::info!(
            "encoding {} at {}x{} @ {} fps",
            self.path.display(),
            width,
            height,
            self.fps
        );
        Ok(Encoding {
            octx,
            encoder,
            scaler,
            stream_index,
            encoder_time_base: time_base,
            stream_time_base,
            width,
            height,
            next_pts: 0,
        })
    }
}

impl Encoding {
    fn encode(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if frame.width() & !1 != self.width || frame.height() & !1 != self.height {
            return Err(SinkError::Encoder(format!(
                "frame {} is {}x{}, stream is {}x{}",
                frame.index(),
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let mut rgb = ffmpeg::frame::Video::new(Pixel::RGB24, self.width, self.height);
        let stride = rgb.stride(0);
        let src_row = frame.width() as usize * 3;
        let dst_row = self.width as usize * 3;
        let src = frame.as_rgb_bytes();
        let dst = rgb.data_mut(0);
        for row in 0..self.height as usize {
            dst[row * stride..row * stride + dst_row]
                .copy_from_slice(&src[row * src_row..row * src_row + dst_row]);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&rgb, &mut yuv)
            .map_err(|e| encoder_err("convert frame", e))?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;
        self.encoder
            .send_frame(&yuv)
            .map_err(|e| encoder_err("send frame", e))?;
        self.write_packets()
    }

    fn write_packets(&mut self) -> Result<(), SinkError> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.octx)
                .map_err(|e| encoder_err("write packet", e))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.encoder
            .send_eof()
            .map_err(|e| encoder_err("flush encoder", e))?;
        self.write_packets()?;
        self.octx
            .write_trailer()
            .map_err(|e| encoder_err("write trailer", e))
    }
}

impl FrameSink for FfmpegVideoSink {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if self.finished {
            return Err(SinkError::Finished);
        }
        if self.encoding.is_none() {
            self.encoding = Some(self.start(frame)?);
        }
        match self.encoding.as_mut() {
            Some(encoding) => encoding.encode(frame),
            None => Err(SinkError::Encoder("encoder not started".into())),
        }
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        match self.encoding.take() {
            Some(mut encoding) => encoding.finish(),
            None => {
                log::warn!("{}: no frames written, no file produced", self.path.display());
                Ok(())
            }
        }
    }
}
