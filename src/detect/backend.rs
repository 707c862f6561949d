use crate::detect::result::Candidate;
use crate::error::DetectorError;
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend adapts one concrete model (or heuristic) to a single `detect`
/// operation. The pipeline never sees the model's own result objects, only
/// the `Candidate` boxes returned here.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Coordinates are in pixels of `frame`. Thresholding and clamping happen
    /// in the pipeline, so backends may return raw scores.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>, DetectorError>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<(), DetectorError> {
        Ok(())
    }
}

impl<D: DetectorBackend + ?Sized> DetectorBackend for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>, DetectorError> {
        (**self).detect(frame)
    }

    fn warm_up(&mut self) -> Result<(), DetectorError> {
        (**self).warm_up()
    }
}
