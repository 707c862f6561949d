//! Frame container.
//!
//! A `Frame` owns one decoded RGB8 image plus its position in the stream.
//! Frames are produced once by a `FrameSource`, owned by the orchestrator for
//! a single loop iteration and dropped after the sink has written them.

use image::RgbImage;

/// One decoded frame. Indices start at 1.
#[derive(Clone, Debug)]
pub struct Frame {
    index: u64,
    timestamp_sec: f64,
    pixels: RgbImage,
}

impl Frame {
    /// Wrap a decoded image. `index` 0 is bumped to 1.
    pub fn new(index: u64, timestamp_sec: f64, pixels: RgbImage) -> Self {
        Self {
            index: index.max(1),
            timestamp_sec,
            pixels,
        }
    }

    /// Solid-colour frame, handy for synthetic sources and tests.
    pub fn filled(index: u64, timestamp_sec: f64, width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = RgbImage::from_pixel(width.max(1), height.max(1), image::Rgb(rgb));
        Self::new(index, timestamp_sec, pixels)
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Position of the frame in the stream, in seconds.
    pub fn timestamp_sec(&self) -> f64 {
        self.timestamp_sec
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    /// Raw interleaved RGB bytes, row-major.
    pub fn as_rgb_bytes(&self) -> &[u8] {
        self.pixels.as_raw()
    }

    /// Same position in the stream, new pixel buffer.
    pub(crate) fn with_pixels(&self, pixels: RgbImage) -> Self {
        Self {
            index: self.index,
            timestamp_sec: self.timestamp_sec,
            pixels,
        }
    }

    pub fn into_pixels(self) -> RgbImage {
        self.pixels
    }
}

/// Stream timestamp for a 1-based frame index.
pub(crate) fn stream_time(index: u64, frame_rate: Option<f64>) -> f64 {
    match frame_rate {
        Some(rate) if rate > 0.0 => (index.saturating_sub(1)) as f64 / rate,
        _ => 0.0,
    }
}
