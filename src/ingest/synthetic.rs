//! Synthetic `stub://` source.
//!
//! Renders a gradient background with a bright square sweeping across it, so
//! the motion backend has something to find. No files are touched.

use image::{Rgb, RgbImage};
use url::Url;

use super::FrameSource;
use crate::error::SourceError;
use crate::frame::{stream_time, Frame};

const DEFAULT_FRAMES: u64 = 100;
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

#[derive(Clone, Debug)]
pub struct SyntheticSource {
    name: String,
    total_frames: u64,
    fps: f64,
    width: u32,
    height: u32,
    emitted: u64,
}

impl SyntheticSource {
    pub fn new(name: &str, total_frames: u64, fps: f64, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            total_frames,
            fps,
            width: width.max(1),
            height: height.max(1),
            emitted: 0,
        }
    }

    /// Parse `stub://name?frames=N&fps=F&width=W&height=H`. All query keys
    /// are optional.
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        let url = Url::parse(raw)
            .map_err(|e| SourceError::unreadable(format!("invalid stub url '{}': {}", raw, e)))?;
        if url.scheme() != "stub" {
            return Err(SourceError::unreadable(format!("not a stub url: {}", raw)));
        }
        let name = url.host_str().unwrap_or("stub").to_string();
        let mut source = Self::new(&name, DEFAULT_FRAMES, DEFAULT_FPS, DEFAULT_WIDTH, DEFAULT_HEIGHT);
        for (key, value) in url.query_pairs() {
            let bad = |what: &str| {
                SourceError::unreadable(format!("stub url '{}': invalid {} '{}'", raw, what, value))
            };
            match key.as_ref() {
                "frames" => source.total_frames = value.parse().map_err(|_| bad("frames"))?,
                "fps" => {
                    let fps: f64 = value.parse().map_err(|_| bad("fps"))?;
                    if !(fps.is_finite() && fps > 0.0) {
                        return Err(bad("fps"));
                    }
                    source.fps = fps;
                }
                "width" => source.width = parse_extent(&value).ok_or_else(|| bad("width"))?,
                "height" => source.height = parse_extent(&value).ok_or_else(|| bad("height"))?,
                other => log::warn!("stub url '{}': ignoring unknown key '{}'", raw, other),
            }
        }
        Ok(source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn render(&self, index: u64) -> RgbImage {
        let (w, h) = (self.width, self.height);
        let side = (w.min(h) / 6).max(1);
        let travel = w.saturating_sub(side).max(1) as u64;
        let left = ((index * 4) % travel) as u32;
        let top = (h - side.min(h)) / 2;
        RgbImage::from_fn(w, h, |x, y| {
            if x >= left && x < left + side && y >= top && y < top + side {
                Rgb([240, 240, 240])
            } else {
                let r = (x * 96 / w) as u8;
                let g = (y * 96 / h) as u8;
                Rgb([r, g, 48])
            }
        })
    }
}

fn parse_extent(value: &str) -> Option<u32> {
    value.parse::<u32>().ok().filter(|v| *v > 0 && *v <= 8192)
}

impl FrameSource for SyntheticSource {
    fn frame_rate(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.emitted >= self.total_frames {
            return Ok(None);
        }
        self.emitted += 1;
        let index = self.emitted;
        Ok(Some(Frame::new(
            index,
            stream_time(index, Some(self.fps)),
            self.render(index),
        )))
    }
}
