//! Video file source using FFmpeg.
//!
//! Decodes the best video stream to RGB24 in memory. At end of input the
//! decoder is drained so trailing buffered frames are not lost.

use std::path::Path;

use ffmpeg_next as ffmpeg;
use image::RgbImage;

use super::FrameSource;
use crate::error::SourceError;
use crate::frame::{stream_time, Frame};

pub struct FfmpegVideoSource {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_rate: Option<f64>,
    frame_count: u64,
    eof_sent: bool,
}

fn unreadable(path: &Path, what: &str, err: impl std::fmt::Display) -> SourceError {
    SourceError::unreadable(format!("{}: {}: {}", path.display(), what, err))
}

impl FfmpegVideoSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        ffmpeg::init().map_err(|e| unreadable(path, "initialize ffmpeg", e))?;
        let input = ffmpeg::format::input(&path).map_err(|e| unreadable(path, "open input", e))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| SourceError::unreadable(format!("{}: no video track", path.display())))?;
        let stream_index = stream.index();
        let rate = stream.avg_frame_rate();
        let frame_rate = if rate.denominator() != 0 && rate.numerator() > 0 {
            Some(f64::from(rate))
        } else {
            None
        };
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| unreadable(path, "load decoder parameters", e))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| unreadable(path, "open video decoder", e))?;
        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| unreadable(path, "create scaler", e))?;

        log::info!(
            "video {}: {}x{} @ {:?} fps",
            path.display(),
            decoder.width(),
            decoder.height(),
            frame_rate
        );
        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            frame_rate,
            frame_count: 0,
            eof_sent: false,
        })
    }

    fn receive(&mut self) -> Result<Option<Frame>, SourceError> {
        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }
        let mut rgb = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb)
            .map_err(|e| SourceError::unreadable(format!("scale frame to RGB: {}", e)))?;
        let pixels = frame_to_image(&rgb)?;
        self.frame_count += 1;
        let index = self.frame_count;
        Ok(Some(Frame::new(index, stream_time(index, self.frame_rate), pixels)))
    }
}

impl FrameSource for FfmpegVideoSource {
    fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.decoder.width(), self.decoder.height()))
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if let Some(frame) = self.receive()? {
            return Ok(Some(frame));
        }
        if self.eof_sent {
            return Ok(None);
        }
        loop {
            let next = self.input.packets().next();
            let Some((stream, packet)) = next else {
                break;
            };
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .map_err(|e| SourceError::unreadable(format!("decode packet: {}", e)))?;
            if let Some(frame) = self.receive()? {
                return Ok(Some(frame));
            }
        }
        self.eof_sent = true;
        self.decoder
            .send_eof()
            .map_err(|e| SourceError::unreadable(format!("drain decoder: {}", e)))?;
        self.receive()
    }

    fn close(&mut self) {
        log::debug!("video source closed after {} frames", self.frame_count);
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage, SourceError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let slice = data
            .get(start..start + row_bytes)
            .ok_or_else(|| SourceError::unreadable("ffmpeg frame row is out of bounds"))?;
        pixels.extend_from_slice(slice);
    }
    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| SourceError::unreadable("ffmpeg frame has unexpected size"))
}
