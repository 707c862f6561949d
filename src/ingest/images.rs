//! Still-image sources: a directory of images or a single file.

use std::path::{Path, PathBuf};

use super::{has_image_extension, FrameSource};
use crate::error::SourceError;
use crate::frame::{stream_time, Frame};

fn decode(path: &Path, index: u64, frame_rate: Option<f64>) -> Result<Frame, SourceError> {
    let pixels = image::open(path)
        .map_err(|e| SourceError::unreadable(format!("{}: {}", path.display(), e)))?
        .to_rgb8();
    Ok(Frame::new(index, stream_time(index, frame_rate), pixels))
}

fn read_dimensions(path: &Path) -> Result<(u32, u32), SourceError> {
    image::image_dimensions(path)
        .map_err(|e| SourceError::unreadable(format!("{}: {}", path.display(), e)))
}

/// Images in a directory, in file-name order. Non-image files are skipped.
#[derive(Debug)]
pub struct ImageDirectorySource {
    paths: Vec<PathBuf>,
    next: usize,
    dimensions: (u32, u32),
    frame_rate: Option<f64>,
}

impl ImageDirectorySource {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| SourceError::unreadable(format!("{}: {}", dir.display(), e)))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| SourceError::unreadable(format!("{}: {}", dir.display(), e)))?;
            let path = entry.path();
            if path.is_file() && has_image_extension(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        let first = paths.first().ok_or_else(|| {
            SourceError::unreadable(format!("{}: no images found", dir.display()))
        })?;
        let dimensions = read_dimensions(first)?;
        log::info!(
            "image directory {}: {} frames at {}x{}",
            dir.display(),
            paths.len(),
            dimensions.0,
            dimensions.1
        );
        Ok(Self {
            paths,
            next: 0,
            dimensions,
            frame_rate: None,
        })
    }

    /// Assign a nominal rate so frame timestamps are meaningful.
    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        self.frame_rate = Some(fps).filter(|f| f.is_finite() && *f > 0.0);
        self
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageDirectorySource {
    fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        Some(self.dimensions)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        decode(path, self.next as u64, self.frame_rate).map(Some)
    }
}

/// A single image presented as a one-frame stream.
#[derive(Debug)]
pub struct SingleImageSource {
    path: PathBuf,
    dimensions: (u32, u32),
    done: bool,
}

impl SingleImageSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let dimensions = read_dimensions(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            dimensions,
            done: false,
        })
    }
}

impl FrameSource for SingleImageSource {
    fn frame_rate(&self) -> Option<f64> {
        None
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        Some(self.dimensions)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        decode(&self.path, 1, None).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_png(dir: &Path, name: &str, shade: u8) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(8, 6, Rgb([shade, shade, shade]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn directory_frames_follow_file_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png", 20);
        write_png(dir.path(), "a.png", 10);
        std::fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();

        let mut source = ImageDirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.dimensions(), Some((8, 6)));

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.index(), 1);
        assert_eq!(first.pixels().get_pixel(0, 0), &Rgb([10, 10, 10]));
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.index(), 2);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn empty_directory_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageDirectorySource::open(dir.path()).unwrap_err();
        assert!(matches!(err, SourceError::Unreadable(_)));
    }

    #[test]
    fn single_image_yields_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "still.png", 99);
        let mut source = SingleImageSource::open(&path).unwrap();
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn corrupt_image_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        assert!(matches!(
            SingleImageSource::open(&path),
            Err(SourceError::Unreadable(_))
        ));
    }
}
