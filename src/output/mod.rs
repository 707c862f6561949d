//! Destinations for annotated frames.
//!
//! A sink receives frames in stream order. Write failures are fatal to the
//! run; `finish` flushes container trailers and releases file handles and is
//! called exactly once, on every exit path.

mod images;
#[cfg(feature = "video-ffmpeg")]
mod video_ffmpeg;

use std::path::Path;

pub use images::ImageSequenceSink;
#[cfg(feature = "video-ffmpeg")]
pub use video_ffmpeg::FfmpegVideoSink;

use crate::error::SinkError;
use crate::frame::Frame;

/// Container extensions routed to the video encoder.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "mov"];

/// Frame rate assumed for video output when the source has none.
pub const DEFAULT_OUTPUT_FPS: f64 = 30.0;

pub trait FrameSink {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError>;

    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        (**self).write(frame)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        (**self).finish()
    }
}

/// Discards frames. Used when only the detection log is wanted.
#[derive(Debug, Default)]
pub struct NullSink {
    written: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for NullSink {
    fn write(&mut self, _frame: &Frame) -> Result<(), SinkError> {
        self.written += 1;
        Ok(())
    }
}

/// Open the sink for `path`: video containers by extension, image
/// sequences otherwise.
pub fn open_sink(path: &str, frame_rate: Option<f64>) -> Result<Box<dyn FrameSink>, SinkError> {
    let p = Path::new(path);
    if is_video_path(p) {
        return open_video(p, frame_rate.unwrap_or(DEFAULT_OUTPUT_FPS));
    }
    Ok(Box::new(ImageSequenceSink::new(p)?))
}

pub(crate) fn is_video_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(feature = "video-ffmpeg")]
fn open_video(path: &Path, fps: f64) -> Result<Box<dyn FrameSink>, SinkError> {
    Ok(Box::new(FfmpegVideoSink::create(path, fps)?))
}

#[cfg(not(feature = "video-ffmpeg"))]
fn open_video(path: &Path, _fps: f64) -> Result<Box<dyn FrameSink>, SinkError> {
    Err(SinkError::Encoder(format!(
        "{}: video output requires the video-ffmpeg feature",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_paths_are_detected_by_extension() {
        assert!(is_video_path(Path::new("out/clip.MP4")));
        assert!(is_video_path(Path::new("a.mkv")));
        assert!(!is_video_path(Path::new("frames")));
        assert!(!is_video_path(Path::new("still.png")));
    }

    #[cfg(not(feature = "video-ffmpeg"))]
    #[test]
    fn video_output_without_feature_is_an_encoder_error() {
        let err = open_sink("/tmp/out.mp4", None).err().expect("error");
        assert!(matches!(err, SinkError::Encoder(_)));
    }

    #[test]
    fn null_sink_counts_frames() {
        let mut sink = NullSink::new();
        sink.write(&Frame::filled(1, 0.0, 2, 2, [0, 0, 0])).unwrap();
        sink.finish().unwrap();
        assert_eq!(sink.written(), 1);
    }
}
