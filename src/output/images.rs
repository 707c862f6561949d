//! Numbered image files, one per frame.

use std::path::{Path, PathBuf};

use super::FrameSink;
use crate::error::SinkError;
use crate::frame::Frame;
use crate::ingest::has_image_extension;

/// Writes `frame_000001.png`, ... into a directory, or
/// `{stem}_000001.{ext}` next to a file-like target such as `out/shot.jpg`.
#[derive(Debug)]
pub struct ImageSequenceSink {
    dir: PathBuf,
    stem: String,
    ext: String,
    written: u64,
    finished: bool,
}

impl ImageSequenceSink {
    pub fn new(target: &Path) -> Result<Self, SinkError> {
        let (dir, stem, ext) = if has_image_extension(target) {
            let dir = target
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let stem = target
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("frame")
                .to_string();
            let ext = target
                .extension()
                .and_then(|s| s.to_str())
                .unwrap_or("png")
                .to_ascii_lowercase();
            (dir, stem, ext)
        } else {
            (target.to_path_buf(), "frame".to_string(), "png".to_string())
        };
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            stem,
            ext,
            written: 0,
            finished: false,
        })
    }

    pub fn path_for(&self, index: u64) -> PathBuf {
        self.dir
            .join(format!("{}_{:06}.{}", self.stem, index, self.ext))
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for ImageSequenceSink {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if self.finished {
            return Err(SinkError::Finished);
        }
        frame.pixels().save(self.path_for(frame.index()))?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if !self.finished {
            self.finished = true;
            log::info!("wrote {} frames to {}", self.written, self.dir.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_target_gets_numbered_pngs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("annotated");
        let mut sink = ImageSequenceSink::new(&out).unwrap();
        sink.write(&Frame::filled(1, 0.0, 4, 4, [1, 2, 3])).unwrap();
        sink.write(&Frame::filled(2, 0.0, 4, 4, [1, 2, 3])).unwrap();
        sink.finish().unwrap();

        assert!(out.join("frame_000001.png").is_file());
        assert!(out.join("frame_000002.png").is_file());
        assert_eq!(sink.written(), 2);
    }

    #[test]
    fn file_target_uses_stem_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ImageSequenceSink::new(&dir.path().join("shot.JPG")).unwrap();
        assert_eq!(sink.path_for(7), dir.path().join("shot_000007.jpg"));
    }

    #[test]
    fn write_after_finish_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ImageSequenceSink::new(dir.path()).unwrap();
        sink.finish().unwrap();
        let err = sink.write(&Frame::filled(1, 0.0, 2, 2, [0, 0, 0])).unwrap_err();
        assert!(matches!(err, SinkError::Finished));
    }
}
