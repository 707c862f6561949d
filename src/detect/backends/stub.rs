use crate::detect::backend::DetectorBackend;
use crate::detect::result::Candidate;
use crate::error::DetectorError;
use crate::frame::Frame;

/// Backend that never finds anything. Useful for dry runs of the pipeline.
#[derive(Default)]
pub struct StubBackend;

impl StubBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Candidate>, DetectorError> {
        Ok(Vec::new())
    }
}
