//! inference-log: sparse detection, frame annotation and a durable detection
//! log.
//!
//! A run reads frames from a `FrameSource`, calls the detector only on
//! scheduled tick frames, draws the most recent detections onto every frame
//! and writes the result to a `FrameSink`. Each detection becomes a
//! `DetectionRecord` in an in-memory `EventBuffer` that is committed to a
//! `PersistenceSink` (SQLite by default) in periodic, single-flight batches.
//!
//! The moving parts:
//! - `schedule`: which frames tick
//! - `cache`: the last tick's detections, as an immutable snapshot
//! - `annotate`: boxes and labels on a copy of the frame
//! - `buffer` / `flush` / `storage`: pending records and their commits
//! - `pipeline`: the orchestrator state machine tying it together

pub mod annotate;
pub mod buffer;
pub mod cache;
pub mod clock;
pub mod config;
pub mod detect;
pub mod error;
pub mod flush;
pub mod frame;
pub mod ingest;
pub mod output;
pub mod pipeline;
pub mod schedule;
pub mod storage;

pub use annotate::{class_color, Annotator, AnnotatorStyle};
pub use buffer::{DetectionRecord, EventBuffer, Provenance};
pub use cache::{CacheState, DetectionCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DetectorSettings, PipelineSettings};
#[cfg(feature = "backend-tract")]
pub use detect::TractBackend;
pub use detect::{
    BackendRegistry, Candidate, CpuBackend, Detection, DetectionSet, DetectorBackend, StubBackend,
};
pub use error::{
    CacheError, Component, DetectorError, PersistenceError, PipelineError, SinkError, SourceError,
};
pub use flush::{FlushMode, FlushOutcome};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource};
pub use output::{open_sink, FrameSink, ImageSequenceSink, NullSink};
pub use pipeline::{
    Orchestrator, PipelineConfig, PipelineParts, PipelineState, RunSummary, StopSignal,
    TerminationReason,
};
pub use schedule::InferenceScheduler;
pub use storage::{
    derive_table_id, InMemoryPersistenceSink, PersistenceSink, SqlitePersistenceSink,
    DETECTION_COLUMNS, TABLE_PREFIX,
};
