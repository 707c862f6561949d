//! Error taxonomy for the annotation pipeline.
//!
//! Each external collaborator has its own error type. The orchestrator wraps
//! them in `PipelineError`, which always carries the frame id that was being
//! processed when the failure surfaced.

use thiserror::Error;

/// Frame source failures. End of stream is NOT an error.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("source unreadable: {0}")]
    Unreadable(String),
}

impl SourceError {
    pub fn unreadable<S: Into<String>>(msg: S) -> Self {
        Self::Unreadable(msg.into())
    }
}

/// Detector failures. Recoverable from the pipeline's point of view.
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

impl DetectorError {
    pub fn model_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ModelUnavailable(msg.into())
    }

    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }
}

/// Frame sink failures. Always fatal to the run.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("sink already finished")]
    Finished,
}

/// Persistence failures. Recoverable until the retry bound is exceeded.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("schema error: {0}")]
    Schema(String),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("insert error: {0}")]
    Insert(String),
}

/// Rejected cache updates.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    #[error("detection set frame {found} does not match tick frame {expected}")]
    FrameMismatch { expected: u64, found: u64 },
}

/// Component that produced a pipeline error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Source,
    Detector,
    Sink,
    Persistence,
    Orchestrator,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Component::Source => "source",
            Component::Detector => "detector",
            Component::Sink => "sink",
            Component::Persistence => "persistence",
            Component::Orchestrator => "orchestrator",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the orchestrator.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("source error at frame {frame_id}: {source}")]
    Source {
        frame_id: u64,
        #[source]
        source: SourceError,
    },

    #[error("detector error at frame {frame_id}: {source}")]
    Detector {
        frame_id: u64,
        #[source]
        source: DetectorError,
    },

    #[error("sink error at frame {frame_id}: {source}")]
    Sink {
        frame_id: u64,
        #[source]
        source: SinkError,
    },

    #[error("persistence error at frame {frame_id} after {attempts} attempt(s): {source}")]
    Persistence {
        frame_id: u64,
        attempts: u32,
        #[source]
        source: PersistenceError,
    },

    #[error("pipeline already terminated")]
    Terminated,
}

impl PipelineError {
    pub fn component(&self) -> Component {
        match self {
            PipelineError::Source { .. } => Component::Source,
            PipelineError::Detector { .. } => Component::Detector,
            PipelineError::Sink { .. } => Component::Sink,
            PipelineError::Persistence { .. } => Component::Persistence,
            PipelineError::Terminated => Component::Orchestrator,
        }
    }

    /// Frame being processed when the error surfaced (0 before the first frame).
    pub fn frame_id(&self) -> u64 {
        match self {
            PipelineError::Source { frame_id, .. }
            | PipelineError::Detector { frame_id, .. }
            | PipelineError::Sink { frame_id, .. }
            | PipelineError::Persistence { frame_id, .. } => *frame_id,
            PipelineError::Terminated => 0,
        }
    }
}
