#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use inference_log::storage::Column;
use inference_log::{
    Candidate, DetectionRecord, DetectorBackend, DetectorError, Frame, FrameSink, FrameSource,
    InMemoryPersistenceSink, ManualClock, PersistenceError, PersistenceSink, SinkError,
    SourceError, StopSignal,
};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;
pub const GREY: [u8; 3] = [40, 40, 40];

/// In-memory frames, optionally advancing a manual clock before each one.
pub struct TestSource {
    remaining: u64,
    emitted: u64,
    fps: Option<f64>,
    clock: Option<(ManualClock, Duration)>,
    stop_at: Option<(u64, StopSignal)>,
    pub closed: Arc<AtomicBool>,
}

impl TestSource {
    pub fn new(frames: u64, fps: Option<f64>) -> Self {
        Self {
            remaining: frames,
            emitted: 0,
            fps,
            clock: None,
            stop_at: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn ticking(mut self, clock: &ManualClock, step: Duration) -> Self {
        self.clock = Some((clock.clone(), step));
        self
    }

    /// Trigger `stop` while handing out frame `frame`.
    pub fn stopping_at(mut self, frame: u64, stop: StopSignal) -> Self {
        self.stop_at = Some((frame, stop));
        self
    }
}

impl FrameSource for TestSource {
    fn frame_rate(&self) -> Option<f64> {
        self.fps
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        Some((WIDTH, HEIGHT))
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.emitted += 1;
        if let Some((clock, step)) = &self.clock {
            clock.advance(*step);
        }
        if let Some((frame, stop)) = &self.stop_at {
            if *frame == self.emitted {
                stop.trigger();
            }
        }
        Ok(Some(Frame::filled(self.emitted, 0.0, WIDTH, HEIGHT, GREY)))
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Keeps every written frame for inspection.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub frames: Arc<Mutex<Vec<Frame>>>,
    pub finished: Arc<AtomicBool>,
}

impl FrameSink for RecordingSink {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub type Step = Result<Vec<Candidate>, DetectorError>;

/// Returns scripted results per frame index; unscripted frames find nothing.
pub struct ScriptedDetector {
    script: HashMap<u64, Step>,
    pub calls: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedDetector {
    pub fn new(script: Vec<(u64, Step)>) -> Self {
        Self {
            script: script.into_iter().collect(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl DetectorBackend for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>, DetectorError> {
        self.calls.lock().unwrap().push(frame.index());
        match self.script.remove(&frame.index()) {
            Some(step) => step,
            None => Ok(Vec::new()),
        }
    }
}

/// Reports one detection on every call.
pub struct AlwaysOne;

impl DetectorBackend for AlwaysOne {
    fn name(&self) -> &'static str {
        "always-one"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Candidate>, DetectorError> {
        Ok(vec![person(0.9)])
    }
}

pub fn person(confidence: f32) -> Candidate {
    Candidate::new("person", confidence, [10.0, 10.0, 40.0, 30.0])
}

/// How `FlakyStore` misbehaves on a failing call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Nothing reaches the store.
    Reject,
    /// The batch is stored, then an error is reported anyway.
    CommitThenFail,
}

/// Wraps the in-memory store and fails the first `fail_calls` appends.
pub struct FlakyStore {
    pub inner: InMemoryPersistenceSink,
    fail_calls: usize,
    mode: Failure,
    calls: usize,
}

impl FlakyStore {
    pub fn new(inner: InMemoryPersistenceSink, fail_calls: usize, mode: Failure) -> Self {
        Self {
            inner,
            fail_calls,
            mode,
            calls: 0,
        }
    }
}

impl PersistenceSink for FlakyStore {
    fn ensure_schema(&mut self, table_id: &str, columns: &[Column]) -> Result<(), PersistenceError> {
        self.inner.ensure_schema(table_id, columns)
    }

    fn append_batch(
        &mut self,
        table_id: &str,
        records: &[DetectionRecord],
    ) -> Result<usize, PersistenceError> {
        self.calls += 1;
        if self.calls <= self.fail_calls {
            if self.mode == Failure::CommitThenFail {
                self.inner.append_batch(table_id, records)?;
            }
            return Err(PersistenceError::Insert(format!(
                "simulated failure #{}",
                self.calls
            )));
        }
        self.inner.append_batch(table_id, records)
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.inner.close()
    }
}

/// Test-side handle of a `GatedStore`.
pub struct Gate {
    /// Signalled when the held append starts.
    pub entered: Receiver<()>,
    /// Send once to let the held append finish.
    pub release: Sender<()>,
}

/// Holds the first `append_batch` until released and keeps the frame ids of
/// every batch it sees.
pub struct GatedStore {
    pub inner: InMemoryPersistenceSink,
    pub batches: Arc<Mutex<Vec<Vec<u64>>>>,
    entered: Sender<()>,
    release: Receiver<()>,
    held: bool,
}

impl GatedStore {
    pub fn new(inner: InMemoryPersistenceSink) -> (Self, Gate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = Self {
            inner,
            batches: Arc::new(Mutex::new(Vec::new())),
            entered: entered_tx,
            release: release_rx,
            held: false,
        };
        let gate = Gate {
            entered: entered_rx,
            release: release_tx,
        };
        (store, gate)
    }
}

impl PersistenceSink for GatedStore {
    fn ensure_schema(&mut self, table_id: &str, columns: &[Column]) -> Result<(), PersistenceError> {
        self.inner.ensure_schema(table_id, columns)
    }

    fn append_batch(
        &mut self,
        table_id: &str,
        records: &[DetectionRecord],
    ) -> Result<usize, PersistenceError> {
        self.batches
            .lock()
            .unwrap()
            .push(records.iter().map(|r| r.detection.frame_id).collect());
        if !self.held {
            self.held = true;
            let _ = self.entered.send(());
            self.release
                .recv_timeout(Duration::from_secs(10))
                .map_err(|_| PersistenceError::Insert("gate never released".into()))?;
        }
        self.inner.append_batch(table_id, records)
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        self.inner.close()
    }
}
