//! Detector contract, detection types and concrete backends.

mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use backends::{CpuBackend, StubBackend};
pub use registry::BackendRegistry;
pub use result::{Candidate, Detection, DetectionSet};
