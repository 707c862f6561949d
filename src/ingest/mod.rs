//! Frame ingestion sources.
//!
//! Every source yields an ordered, finite sequence of `Frame`s with 1-based
//! indices. `Ok(None)` marks the end of the stream; it is not an error.
//!
//! Supported inputs:
//! - `stub://name?frames=N&fps=F&width=W&height=H` synthetic streams (tests, demos)
//! - a directory of images, read in file-name order
//! - a single image file (one frame)
//! - video files (feature: video-ffmpeg)

#[cfg(feature = "video-ffmpeg")]
mod file_ffmpeg;
mod images;
mod synthetic;

use std::path::Path;

#[cfg(feature = "video-ffmpeg")]
pub use file_ffmpeg::FfmpegVideoSource;
pub use images::{ImageDirectorySource, SingleImageSource};
pub use synthetic::SyntheticSource;

use crate::error::SourceError;
use crate::frame::Frame;

/// Extensions decoded through the `image` crate.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Ordered, finite frame producer.
pub trait FrameSource {
    /// Native frame rate, when the container exposes one.
    fn frame_rate(&self) -> Option<f64>;

    /// `(width, height)` of the stream, when known up front.
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Release any decoder state. Called once when the run drains.
    fn close(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn frame_rate(&self) -> Option<f64> {
        (**self).frame_rate()
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        (**self).dimensions()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        (**self).next_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Open the source named by `path`.
pub fn open_source(path: &str) -> Result<Box<dyn FrameSource>, SourceError> {
    if path.trim().is_empty() {
        return Err(SourceError::NotFound("empty source path".into()));
    }
    if path.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::parse(path)?));
    }
    if path.contains("://") {
        return Err(SourceError::unreadable(format!(
            "only local paths are supported: {}",
            path
        )));
    }

    let p = Path::new(path);
    if !p.exists() {
        return Err(SourceError::NotFound(path.to_string()));
    }
    if p.is_dir() {
        return Ok(Box::new(ImageDirectorySource::open(p)?));
    }
    if has_image_extension(p) {
        return Ok(Box::new(SingleImageSource::open(p)?));
    }
    open_video(p)
}

#[cfg(feature = "video-ffmpeg")]
fn open_video(path: &Path) -> Result<Box<dyn FrameSource>, SourceError> {
    Ok(Box::new(FfmpegVideoSource::open(path)?))
}

#[cfg(not(feature = "video-ffmpeg"))]
fn open_video(path: &Path) -> Result<Box<dyn FrameSource>, SourceError> {
    Err(SourceError::unreadable(format!(
        "{}: video decoding requires the video-ffmpeg feature",
        path.display()
    )))
}

pub(crate) fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_is_not_found() {
        let err = open_source("/definitely/not/here.mp4").err().expect("error");
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[test]
    fn remote_urls_are_rejected() {
        let err = open_source("rtsp://camera/stream").err().expect("error");
        assert!(matches!(err, SourceError::Unreadable(_)));
    }

    #[test]
    fn stub_source_opens() {
        let mut source = open_source("stub://demo?frames=2&fps=10").unwrap();
        assert_eq!(source.frame_rate(), Some(10.0));
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn image_extensions_are_case_insensitive() {
        assert!(has_image_extension(Path::new("a/B.JPG")));
        assert!(has_image_extension(Path::new("c.png")));
        assert!(!has_image_extension(Path::new("clip.mp4")));
        assert!(!has_image_extension(Path::new("noext")));
    }
}
