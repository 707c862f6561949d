//! The frame loop.
//!
//! `Orchestrator::run` drives one pass over a source:
//!
//! ```text
//! Idle -> Running -> Draining -> Terminated
//! ```
//!
//! Running reads, schedules, detects, annotates and writes one frame at a
//! time on the calling thread. Detections go to the shared `EventBuffer`
//! which the `Flusher` commits every `commit_interval`. Draining is entered
//! on end of stream, cancellation or a fatal error; it waits for an
//! outstanding flush, runs a final flush and releases the source, sink and
//! store on every path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::Duration;

use serde::Serialize;

use crate::annotate::{Annotator, AnnotatorStyle};
use crate::buffer::{DetectionRecord, EventBuffer, Provenance};
use crate::cache::DetectionCache;
use crate::clock::{unix_now_s, Clock, SystemClock};
use crate::detect::{DetectionSet, DetectorBackend};
use crate::error::{Component, PipelineError};
use crate::flush::{FlushMode, FlushOutcome, FlushTimer, Flusher, SharedBuffer};
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::output::FrameSink;
use crate::schedule::InferenceScheduler;
use crate::storage::{derive_table_id, PersistenceSink};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_FLUSH_RETRIES: u32 = 5;
pub const DEFAULT_BUFFER_WARN_RECORDS: usize = 10_000;
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    EndOfStream,
    Cancelled,
    SourceFailed,
    SinkFailed,
    PersistenceFailed,
}

/// Cooperative cancellation flag, checked at every frame boundary.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Candidates below this confidence are dropped.
    pub confidence_threshold: f32,
    /// Explicit tick interval in frames; derived from the frame rate if unset.
    pub frame_skip: Option<u32>,
    /// Used instead of the source's frame rate when set.
    pub frame_rate_override: Option<f64>,
    pub style: AnnotatorStyle,
    pub commit_interval: Duration,
    /// Consecutive failed flushes tolerated before the run is aborted.
    pub max_flush_retries: u32,
    /// Pending-record count that triggers a backlog warning.
    pub buffer_warn_records: usize,
    pub flush_mode: FlushMode,
    pub source_id: String,
    pub table_id: String,
}

impl PipelineConfig {
    /// Defaults with provenance and table derived from the source path.
    pub fn for_source(source_path: &str) -> Self {
        Self {
            source_id: source_path.to_string(),
            table_id: derive_table_id(source_path),
            ..Self::default()
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            frame_skip: None,
            frame_rate_override: None,
            style: AnnotatorStyle::default(),
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            max_flush_retries: DEFAULT_MAX_FLUSH_RETRIES,
            buffer_warn_records: DEFAULT_BUFFER_WARN_RECORDS,
            flush_mode: FlushMode::default(),
            source_id: "unnamed".to_string(),
            table_id: derive_table_id(""),
        }
    }
}

/// Resources owned by the orchestrator for the duration of a run.
pub struct PipelineParts {
    pub source: Box<dyn FrameSource>,
    pub sink: Box<dyn FrameSink>,
    pub detector: Box<dyn DetectorBackend>,
    pub store: Box<dyn PersistenceSink>,
}

/// Counters reported when a run terminates.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub frames_processed: u64,
    pub ticks: u64,
    pub detections: u64,
    pub detector_failures: u64,
    pub flush_attempts: u64,
    pub flush_failures: u64,
    /// Records in batches the store confirmed, replays included.
    pub records_committed: u64,
    /// Rows newly written; lower than `records_committed` only when a batch
    /// was re-sent after its commit had already landed.
    pub records_inserted: u64,
    pub records_pending: u64,
    pub termination: Option<TerminationReason>,
}

pub struct Orchestrator {
    config: PipelineConfig,
    state: PipelineState,
    parts: Option<PipelineParts>,
    clock: Box<dyn Clock>,
    stop: StopSignal,
    summary: RunSummary,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, parts: PipelineParts) -> Self {
        Self {
            config,
            state: PipelineState::Idle,
            parts: Some(parts),
            clock: Box::new(SystemClock::new()),
            stop: StopSignal::new(),
            summary: RunSummary::default(),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Summary of the last run, also available after a failed run.
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Process the whole source. May be called once.
    pub fn run(&mut self) -> Result<RunSummary, PipelineError> {
        if self.state != PipelineState::Idle {
            return Err(PipelineError::Terminated);
        }
        let Some(parts) = self.parts.take() else {
            return Err(PipelineError::Terminated);
        };
        let PipelineParts {
            mut source,
            mut sink,
            mut detector,
            store,
        } = parts;
        self.state = PipelineState::Running;

        let run_timestamp = unix_now_s().unwrap_or_else(|e| {
            log::warn!("system clock unavailable, run timestamp set to 0: {}", e);
            0
        });
        let provenance = Provenance::new(self.config.source_id.clone(), run_timestamp);
        let buffer: SharedBuffer = Arc::new(Mutex::new(EventBuffer::new()));
        let flusher = match Flusher::start(
            self.config.flush_mode,
            store,
            buffer.clone(),
            &self.config.table_id,
        ) {
            Ok(flusher) => flusher,
            Err(e) => {
                self.state = PipelineState::Draining;
                source.close();
                if let Err(sink_err) = sink.finish() {
                    log::warn!("releasing sink after store failure: {}", sink_err);
                }
                self.summary.termination = Some(TerminationReason::PersistenceFailed);
                self.state = PipelineState::Terminated;
                return Err(PipelineError::Persistence {
                    frame_id: 0,
                    attempts: 1,
                    source: e,
                });
            }
        };

        if let Err(e) = detector.warm_up() {
            log::warn!("detector {} warm-up failed: {}", detector.name(), e);
        }
        let frame_rate = self.config.frame_rate_override.or_else(|| source.frame_rate());
        let scheduler = InferenceScheduler::from_policy(frame_rate, self.config.frame_skip);
        log::info!(
            "pipeline running: run={} detector={} interval={} frames fps={:?} table={} flush={:?}",
            provenance.run_id,
            detector.name(),
            scheduler.interval(),
            frame_rate,
            self.config.table_id,
            self.config.flush_mode
        );

        let started = self.clock.now();
        let mut run = FrameLoop {
            scheduler,
            annotator: Annotator::new(self.config.style),
            cache: DetectionCache::new(),
            buffer,
            staged: Vec::new(),
            timer: FlushTimer::new(self.config.commit_interval, started),
            flusher,
            deferred: false,
            provenance,
            threshold: self.config.confidence_threshold,
            max_flush_retries: self.config.max_flush_retries,
            buffer_warn_records: self.config.buffer_warn_records,
            backlog_warned: false,
            last_health_log: started,
            summary: RunSummary::default(),
        };

        let mut frame_id = 0u64;
        let (reason, fatal) = loop {
            if self.stop.is_triggered() {
                log::info!("stop requested after frame {}", frame_id);
                break (TerminationReason::Cancelled, None);
            }
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break (TerminationReason::EndOfStream, None),
                Err(e) => {
                    let err = PipelineError::Source {
                        frame_id: frame_id + 1,
                        source: e,
                    };
                    break (TerminationReason::SourceFailed, Some(err));
                }
            };
            frame_id = frame.index();
            let now = self.clock.now();
            if let Err(e) = run.process_frame(&frame, detector.as_mut(), sink.as_mut(), now) {
                let reason = match e.component() {
                    Component::Sink => TerminationReason::SinkFailed,
                    _ => TerminationReason::PersistenceFailed,
                };
                break (reason, Some(e));
            }
        };

        self.state = PipelineState::Draining;
        log::info!("pipeline draining ({:?}) at frame {}", reason, frame_id);
        if let Some(err) = &fatal {
            log::error!("{} failure: {}", err.component(), err);
        }
        let (mut summary, fatal) = run.drain(frame_id, fatal);
        source.close();
        let fatal = match sink.finish() {
            Ok(()) => fatal,
            Err(e) => {
                log::error!("finishing output failed: {}", e);
                fatal.or(Some(PipelineError::Sink { frame_id, source: e }))
            }
        };

        summary.termination = Some(reason);
        self.summary = summary.clone();
        self.state = PipelineState::Terminated;
        log::info!(
            "pipeline terminated: frames={} ticks={} detections={} committed={} inserted={} pending={} flush_failures={}",
            summary.frames_processed,
            summary.ticks,
            summary.detections,
            summary.records_committed,
            summary.records_inserted,
            summary.records_pending,
            summary.flush_failures
        );
        match fatal {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

/// Per-run state of the Running phase.
struct FrameLoop {
    scheduler: InferenceScheduler,
    annotator: Annotator,
    cache: DetectionCache,
    buffer: SharedBuffer,
    /// Records produced while the buffer was locked by a flush.
    staged: Vec<DetectionRecord>,
    timer: FlushTimer,
    flusher: Flusher,
    /// A flush came due while another was in flight.
    deferred: bool,
    provenance: Provenance,
    threshold: f32,
    max_flush_retries: u32,
    buffer_warn_records: usize,
    backlog_warned: bool,
    last_health_log: Duration,
    summary: RunSummary,
}

impl FrameLoop {
    fn process_frame(
        &mut self,
        frame: &Frame,
        detector: &mut dyn DetectorBackend,
        sink: &mut dyn FrameSink,
        now: Duration,
    ) -> Result<(), PipelineError> {
        let frame_id = frame.index();
        self.merge_staged();

        if self.scheduler.is_tick(frame_id) {
            self.summary.ticks += 1;
            self.detect(frame, detector);
        }

        let annotated = self.annotator.render(frame, &self.cache.current());
        sink.write(&annotated)
            .map_err(|source| PipelineError::Sink { frame_id, source })?;
        self.summary.frames_processed += 1;

        self.service_flush(now, frame_id)?;

        if now.saturating_sub(self.last_health_log) >= HEALTH_LOG_INTERVAL {
            log::info!(
                "health frames={} ticks={} pending={} committed={} flush_failures={}",
                self.summary.frames_processed,
                self.summary.ticks,
                self.pending_estimate(),
                self.summary.records_committed,
                self.summary.flush_failures
            );
            self.last_health_log = now;
        }
        Ok(())
    }

    fn detect(&mut self, frame: &Frame, detector: &mut dyn DetectorBackend) {
        let frame_id = frame.index();
        let candidates = match detector.detect(frame) {
            Ok(candidates) => candidates,
            Err(source) => {
                self.summary.detector_failures += 1;
                let err = PipelineError::Detector { frame_id, source };
                log::warn!(
                    "{} ({}); keeping detections from frame {:?}",
                    err,
                    detector.name(),
                    self.cache.tick_frame()
                );
                return;
            }
        };
        let set = DetectionSet::from_candidates(frame, &candidates, self.threshold);
        let records: Vec<DetectionRecord> = set
            .iter()
            .enumerate()
            .map(|(ordinal, det)| DetectionRecord::new(det.clone(), ordinal, &self.provenance))
            .collect();
        if let Err(e) = self.cache.update(set, frame_id) {
            log::error!("detection cache rejected update: {}", e);
            return;
        }
        log::debug!(
            "frame {}: {} candidates, {} kept",
            frame_id,
            candidates.len(),
            records.len()
        );
        self.summary.detections += records.len() as u64;
        if !records.is_empty() {
            self.staged.extend(records);
            self.merge_staged();
        }
    }

    /// Move staged records into the shared buffer without blocking.
    fn merge_staged(&mut self) {
        if self.staged.is_empty() {
            return;
        }
        let len = match self.buffer.try_lock() {
            Ok(mut guard) => {
                guard.extend(self.staged.drain(..));
                guard.len()
            }
            Err(TryLockError::WouldBlock) => {
                log::debug!("event buffer busy; {} records staged", self.staged.len());
                return;
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                log::warn!("event buffer lock poisoned; recovering");
                let mut guard = poisoned.into_inner();
                guard.extend(self.staged.drain(..));
                guard.len()
            }
        };
        self.check_backlog(len);
    }

    fn check_backlog(&mut self, len: usize) {
        if len >= self.buffer_warn_records {
            if !self.backlog_warned {
                log::warn!(
                    "event buffer backlog: {} records pending (warn at {})",
                    len,
                    self.buffer_warn_records
                );
                self.backlog_warned = true;
            }
        } else if len < self.buffer_warn_records / 2 {
            self.backlog_warned = false;
        }
    }

    fn has_pending(&self) -> bool {
        if !self.staged.is_empty() {
            return true;
        }
        match self.buffer.try_lock() {
            Ok(guard) => !guard.is_empty(),
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Poisoned(poisoned)) => !poisoned.into_inner().is_empty(),
        }
    }

    fn pending_estimate(&self) -> usize {
        let buffered = match self.buffer.try_lock() {
            Ok(guard) => guard.len(),
            Err(TryLockError::WouldBlock) => 0,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().len(),
        };
        buffered + self.staged.len()
    }

    fn service_flush(&mut self, now: Duration, frame_id: u64) -> Result<(), PipelineError> {
        if let Some(outcome) = self.flusher.poll() {
            self.record_outcome(outcome, frame_id)?;
        }
        if !self.has_pending() {
            self.deferred = false;
            return Ok(());
        }
        if !self.deferred && !self.timer.is_due(now) {
            return Ok(());
        }
        if self.flusher.is_in_flight() {
            if !self.deferred {
                log::debug!("flush due at frame {} while one is in flight; deferring", frame_id);
            }
            self.deferred = true;
            return Ok(());
        }
        self.deferred = false;
        // the previous flush has reported, so the buffer lock is free again
        self.merge_staged();
        self.timer.record_attempt(now);
        if let Some(outcome) = self.flusher.dispatch() {
            self.record_outcome(outcome, frame_id)?;
        }
        Ok(())
    }

    fn record_outcome(&mut self, outcome: FlushOutcome, frame_id: u64) -> Result<(), PipelineError> {
        match outcome {
            FlushOutcome::Skipped => Ok(()),
            FlushOutcome::Committed { records, inserted } => {
                self.summary.flush_attempts += 1;
                self.summary.records_committed += records as u64;
                self.summary.records_inserted += inserted as u64;
                if inserted < records {
                    log::debug!("{} of {} records were already stored", records - inserted, records);
                }
                self.timer.record_success();
                Ok(())
            }
            FlushOutcome::Failed { records, error } => {
                self.summary.flush_attempts += 1;
                self.summary.flush_failures += 1;
                self.deferred = false;
                let failures = self.timer.record_failure();
                if failures > self.max_flush_retries {
                    return Err(PipelineError::Persistence {
                        frame_id,
                        attempts: failures,
                        source: error,
                    });
                }
                log::warn!(
                    "flush of {} records failed (attempt {} of {}), next try in {:?}: {}",
                    records,
                    failures,
                    self.max_flush_retries.saturating_add(1),
                    self.timer.current_interval(),
                    error
                );
                Ok(())
            }
        }
    }

    /// Wait for the outstanding flush, run the final one and close the store.
    fn drain(
        mut self,
        frame_id: u64,
        mut fatal: Option<PipelineError>,
    ) -> (RunSummary, Option<PipelineError>) {
        if let Some(outcome) = self.flusher.wait() {
            if let Err(e) = self.record_outcome(outcome, frame_id) {
                log::error!("{}", e);
                fatal.get_or_insert(e);
            }
        }
        {
            let mut guard = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            guard.extend(self.staged.drain(..));
        }

        let (outcome, closed) = self.flusher.finish();
        match outcome {
            FlushOutcome::Skipped => {}
            FlushOutcome::Committed { records, inserted } => {
                self.summary.flush_attempts += 1;
                self.summary.records_committed += records as u64;
                self.summary.records_inserted += inserted as u64;
            }
            FlushOutcome::Failed { records, error } => {
                self.summary.flush_attempts += 1;
                self.summary.flush_failures += 1;
                log::error!("final flush failed, {} records not persisted: {}", records, error);
                fatal.get_or_insert(PipelineError::Persistence {
                    frame_id,
                    attempts: self.timer.consecutive_failures() + 1,
                    source: error,
                });
            }
        }
        if let Err(e) = closed {
            log::error!("closing store failed: {}", e);
            fatal.get_or_insert(PipelineError::Persistence {
                frame_id,
                attempts: 1,
                source: e,
            });
        }

        let pending = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        self.summary.records_pending = pending as u64;
        (self.summary, fatal)
    }
}
