//! Periodic, single-flight commits of the event buffer.
//!
//! A flush locks the shared `EventBuffer` for the whole drain-and-send, so
//! the store sees each batch exactly once. On failure the batch goes back to
//! the front of the buffer and the next attempt is pushed out with
//! exponential backoff.
//!
//! In `FlushMode::Background` the store lives on a worker thread and the
//! frame loop only sends requests and polls for reports; it never waits on a
//! flush except while draining.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;

use crate::buffer::EventBuffer;
use crate::error::PersistenceError;
use crate::storage::{PersistenceSink, DETECTION_COLUMNS};

/// Buffer shared between the frame loop and the flush worker.
pub type SharedBuffer = Arc<Mutex<EventBuffer>>;

/// Cap on the backoff exponent (interval * 2^6 at most).
const MAX_BACKOFF_SHIFT: u32 = 6;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Flush synchronously on the frame loop thread.
    Inline,
    /// Flush on a dedicated worker thread.
    #[default]
    Background,
}

impl std::str::FromStr for FlushMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(FlushMode::Inline),
            "background" => Ok(FlushMode::Background),
            other => Err(anyhow::anyhow!(
                "unknown flush mode '{}' (expected inline|background)",
                other
            )),
        }
    }
}

/// Result of one flush attempt.
#[derive(Debug)]
pub enum FlushOutcome {
    /// Buffer was empty; nothing was sent.
    Skipped,
    /// `records` were sent, `inserted` of them were new to the store.
    Committed { records: usize, inserted: usize },
    /// The batch was rejected and re-queued.
    Failed {
        records: usize,
        error: PersistenceError,
    },
}

impl FlushOutcome {
    pub fn is_attempt(&self) -> bool {
        !matches!(self, FlushOutcome::Skipped)
    }
}

/// Drain the buffer into the store while holding the buffer lock.
pub fn flush_once(
    buffer: &Mutex<EventBuffer>,
    store: &mut dyn PersistenceSink,
    table_id: &str,
) -> FlushOutcome {
    let mut guard = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    let batch = guard.drain_all();
    if batch.is_empty() {
        return FlushOutcome::Skipped;
    }
    let records = batch.len();
    match store.append_batch(table_id, &batch) {
        Ok(inserted) => FlushOutcome::Committed { records, inserted },
        Err(error) => {
            guard.requeue_front(batch);
            FlushOutcome::Failed { records, error }
        }
    }
}

/// Commit timer with failure backoff.
#[derive(Clone, Debug)]
pub struct FlushTimer {
    interval: Duration,
    last_attempt: Duration,
    consecutive_failures: u32,
}

impl FlushTimer {
    pub fn new(interval: Duration, start: Duration) -> Self {
        Self {
            interval,
            last_attempt: start,
            consecutive_failures: 0,
        }
    }

    /// Time that must pass after the last attempt before the next one.
    pub fn current_interval(&self) -> Duration {
        let shift = self.consecutive_failures.min(MAX_BACKOFF_SHIFT);
        self.interval.saturating_mul(1u32 << shift)
    }

    pub fn is_due(&self, now: Duration) -> bool {
        now.saturating_sub(self.last_attempt) >= self.current_interval()
    }

    pub fn record_attempt(&mut self, now: Duration) {
        self.last_attempt = now;
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

enum FlushRequest {
    Flush,
    Finish,
}

enum WorkerReport {
    Flushed(FlushOutcome),
    Finished(FlushOutcome, Result<(), PersistenceError>),
}

enum Backend {
    Inline {
        store: Box<dyn PersistenceSink>,
    },
    Background {
        requests: Sender<FlushRequest>,
        reports: Receiver<WorkerReport>,
        join: Option<JoinHandle<()>>,
    },
}

/// Runs flushes and enforces the single-flight rule.
pub struct Flusher {
    backend: Backend,
    buffer: SharedBuffer,
    table_id: String,
    in_flight: bool,
}

impl Flusher {
    /// Ensure the schema, then hand the store to the chosen backend.
    ///
    /// On schema failure the store is closed before the error is returned.
    pub fn start(
        mode: FlushMode,
        mut store: Box<dyn PersistenceSink>,
        buffer: SharedBuffer,
        table_id: &str,
    ) -> Result<Self, PersistenceError> {
        if let Err(e) = store.ensure_schema(table_id, DETECTION_COLUMNS) {
            if let Err(close_err) = store.close() {
                log::warn!("closing store after schema failure: {}", close_err);
            }
            return Err(e);
        }
        let backend = match mode {
            FlushMode::Inline => Backend::Inline { store },
            FlushMode::Background => {
                let (req_tx, req_rx) = mpsc::channel();
                let (rep_tx, rep_rx) = mpsc::channel();
                let worker_buffer = buffer.clone();
                let worker_table = table_id.to_string();
                let join = std::thread::Builder::new()
                    .name("flush-worker".into())
                    .spawn(move || run_worker(store, worker_buffer, worker_table, req_rx, rep_tx))
                    .map_err(|e| PersistenceError::Connect(format!("spawn flush worker: {}", e)))?;
                Backend::Background {
                    requests: req_tx,
                    reports: rep_rx,
                    join: Some(join),
                }
            }
        };
        Ok(Self {
            backend,
            buffer,
            table_id: table_id.to_string(),
            in_flight: false,
        })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Start a flush. Inline flushes complete immediately and return their
    /// outcome; background flushes report later through `poll`.
    ///
    /// Callers must not dispatch while a flush is in flight.
    pub fn dispatch(&mut self) -> Option<FlushOutcome> {
        debug_assert!(!self.in_flight, "flush dispatched while another is in flight");
        match &mut self.backend {
            Backend::Inline { store } => Some(flush_once(&self.buffer, store.as_mut(), &self.table_id)),
            Backend::Background { requests, .. } => {
                if requests.send(FlushRequest::Flush).is_err() {
                    return Some(worker_gone());
                }
                self.in_flight = true;
                None
            }
        }
    }

    /// Non-blocking check for a finished background flush.
    pub fn poll(&mut self) -> Option<FlushOutcome> {
        let Backend::Background { reports, .. } = &mut self.backend else {
            return None;
        };
        if !self.in_flight {
            return None;
        }
        match reports.try_recv() {
            Ok(report) => {
                self.in_flight = false;
                Some(report_outcome(report))
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.in_flight = false;
                Some(worker_gone())
            }
        }
    }

    /// Block until the outstanding flush (if any) completes.
    pub fn wait(&mut self) -> Option<FlushOutcome> {
        let Backend::Background { reports, .. } = &mut self.backend else {
            return None;
        };
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        Some(match reports.recv() {
            Ok(report) => report_outcome(report),
            Err(_) => worker_gone(),
        })
    }

    /// Final flush followed by closing the store. Always releases the store.
    pub fn finish(mut self) -> (FlushOutcome, Result<(), PersistenceError>) {
        if let Some(outcome) = self.wait() {
            log::debug!("outstanding flush completed during finish: {:?}", outcome);
        }
        match self.backend {
            Backend::Inline { mut store } => {
                let outcome = flush_once(&self.buffer, store.as_mut(), &self.table_id);
                (outcome, store.close())
            }
            Backend::Background {
                requests,
                reports,
                mut join,
            } => {
                let result = if requests.send(FlushRequest::Finish).is_ok() {
                    loop {
                        match reports.recv() {
                            Ok(WorkerReport::Finished(outcome, closed)) => break (outcome, closed),
                            Ok(WorkerReport::Flushed(_)) => continue,
                            Err(_) => break (worker_gone(), Err(worker_gone_error())),
                        }
                    }
                } else {
                    (worker_gone(), Err(worker_gone_error()))
                };
                if let Some(join) = join.take() {
                    if join.join().is_err() {
                        log::error!("flush worker panicked");
                    }
                }
                result
            }
        }
    }
}

fn run_worker(
    mut store: Box<dyn PersistenceSink>,
    buffer: SharedBuffer,
    table_id: String,
    requests: Receiver<FlushRequest>,
    reports: Sender<WorkerReport>,
) {
    loop {
        match requests.recv() {
            Ok(FlushRequest::Flush) => {
                let outcome = flush_once(&buffer, store.as_mut(), &table_id);
                if reports.send(WorkerReport::Flushed(outcome)).is_err() {
                    break;
                }
            }
            Ok(FlushRequest::Finish) => {
                let outcome = flush_once(&buffer, store.as_mut(), &table_id);
                let closed = store.close();
                let _ = reports.send(WorkerReport::Finished(outcome, closed));
                return;
            }
            Err(_) => break,
        }
    }
    // Orchestrator went away without finishing.
    if let Err(e) = store.close() {
        log::warn!("flush worker: closing store failed: {}", e);
    }
}

fn report_outcome(report: WorkerReport) -> FlushOutcome {
    match report {
        WorkerReport::Flushed(outcome) | WorkerReport::Finished(outcome, _) => outcome,
    }
}

fn worker_gone_error() -> PersistenceError {
    PersistenceError::Connect("flush worker stopped".into())
}

fn worker_gone() -> FlushOutcome {
    FlushOutcome::Failed {
        records: 0,
        error: worker_gone_error(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{DetectionRecord, Provenance};
    use crate::detect::Detection;
    use crate::storage::{Column, InMemoryPersistenceSink};

    fn record(frame_id: u64) -> DetectionRecord {
        let detection = Detection {
            class_name: "person".into(),
            confidence: 0.9,
            x_min: 0,
            y_min: 0,
            x_max: 1,
            y_max: 1,
            frame_id,
            time_sec: 0.0,
        };
        let provenance = Provenance {
            source_id: "s".into(),
            run_timestamp: 1,
            run_id: "run".into(),
        };
        DetectionRecord::new(detection, 0, &provenance)
    }

    /// Fails the first `fail_first` appends, optionally after storing them.
    struct FlakySink {
        inner: InMemoryPersistenceSink,
        fail_first: usize,
        store_before_failing: bool,
        calls: usize,
    }

    impl PersistenceSink for FlakySink {
        fn ensure_schema(&mut self, t: &str, c: &[Column]) -> Result<(), PersistenceError> {
            self.inner.ensure_schema(t, c)
        }

        fn append_batch(
            &mut self,
            t: &str,
            records: &[DetectionRecord],
        ) -> Result<usize, PersistenceError> {
            self.calls += 1;
            if self.calls <= self.fail_first {
                if self.store_before_failing {
                    self.inner.append_batch(t, records)?;
                }
                return Err(PersistenceError::Insert("simulated".into()));
            }
            self.inner.append_batch(t, records)
        }

        fn close(&mut self) -> Result<(), PersistenceError> {
            self.inner.close()
        }
    }

    const TABLE: &str = "inference_log_test";

    #[test]
    fn failed_batch_is_requeued_in_order() {
        let buffer = Mutex::new(EventBuffer::new());
        buffer.lock().unwrap().append(record(1));
        buffer.lock().unwrap().append(record(2));
        let mut sink = FlakySink {
            inner: InMemoryPersistenceSink::new(),
            fail_first: 1,
            store_before_failing: false,
            calls: 0,
        };
        sink.ensure_schema(TABLE, DETECTION_COLUMNS).unwrap();

        let outcome = flush_once(&buffer, &mut sink, TABLE);
        assert!(matches!(outcome, FlushOutcome::Failed { records: 2, .. }));
        assert_eq!(buffer.lock().unwrap().len(), 2);

        let outcome = flush_once(&buffer, &mut sink, TABLE);
        assert!(matches!(
            outcome,
            FlushOutcome::Committed {
                records: 2,
                inserted: 2
            }
        ));
        assert!(buffer.lock().unwrap().is_empty());
        let frames: Vec<u64> = sink
            .inner
            .records(TABLE)
            .iter()
            .map(|r| r.detection.frame_id)
            .collect();
        assert_eq!(frames, vec![1, 2]);
    }

    #[test]
    fn retry_after_ambiguous_failure_does_not_duplicate() {
        let buffer = Mutex::new(EventBuffer::new());
        buffer.lock().unwrap().append(record(1));
        let mut sink = FlakySink {
            inner: InMemoryPersistenceSink::new(),
            fail_first: 1,
            store_before_failing: true,
            calls: 0,
        };
        sink.ensure_schema(TABLE, DETECTION_COLUMNS).unwrap();

        assert!(matches!(
            flush_once(&buffer, &mut sink, TABLE),
            FlushOutcome::Failed { .. }
        ));
        assert!(matches!(
            flush_once(&buffer, &mut sink, TABLE),
            FlushOutcome::Committed { inserted: 0, .. }
        ));
        assert_eq!(sink.inner.records(TABLE).len(), 1);
    }

    #[test]
    fn empty_buffer_is_skipped() {
        let buffer = Mutex::new(EventBuffer::new());
        let mut sink = InMemoryPersistenceSink::new();
        sink.ensure_schema(TABLE, DETECTION_COLUMNS).unwrap();
        let outcome = flush_once(&buffer, &mut sink, TABLE);
        assert!(!outcome.is_attempt());
        assert_eq!(sink.append_calls(), 0);
    }

    #[test]
    fn timer_backs_off_after_failures() {
        let mut timer = FlushTimer::new(Duration::from_secs(2), Duration::ZERO);
        assert!(!timer.is_due(Duration::from_millis(1999)));
        assert!(timer.is_due(Duration::from_secs(2)));

        timer.record_attempt(Duration::from_secs(2));
        assert_eq!(timer.record_failure(), 1);
        assert_eq!(timer.current_interval(), Duration::from_secs(4));
        assert!(!timer.is_due(Duration::from_secs(5)));
        assert!(timer.is_due(Duration::from_secs(6)));

        for _ in 0..20 {
            timer.record_failure();
        }
        assert_eq!(timer.current_interval(), Duration::from_secs(2 * 64));
        timer.record_success();
        assert_eq!(timer.current_interval(), Duration::from_secs(2));
    }

    #[test]
    fn background_flusher_is_single_flight_and_closes_store() {
        let handle = InMemoryPersistenceSink::new();
        let buffer: SharedBuffer = Arc::new(Mutex::new(EventBuffer::new()));
        let mut flusher = Flusher::start(
            FlushMode::Background,
            Box::new(handle.clone()),
            buffer.clone(),
            TABLE,
        )
        .unwrap();

        buffer.lock().unwrap().append(record(1));
        assert!(flusher.dispatch().is_none());
        assert!(flusher.is_in_flight());
        let outcome = flusher.wait().expect("outcome");
        assert!(matches!(outcome, FlushOutcome::Committed { records: 1, .. }));
        assert!(!flusher.is_in_flight());

        buffer.lock().unwrap().append(record(2));
        let (final_outcome, closed) = flusher.finish();
        assert!(matches!(final_outcome, FlushOutcome::Committed { records: 1, .. }));
        assert!(closed.is_ok());
        assert!(handle.is_closed());
        assert_eq!(handle.records(TABLE).len(), 2);
    }

    #[test]
    fn schema_failure_closes_store() {
        let handle = InMemoryPersistenceSink::new();
        let buffer: SharedBuffer = Arc::new(Mutex::new(EventBuffer::new()));
        let result = Flusher::start(
            FlushMode::Inline,
            Box::new(handle.clone()),
            buffer,
            "Not A Table",
        );
        assert!(matches!(result, Err(PersistenceError::Schema(_))));
        assert!(handle.is_closed());
    }

    #[test]
    fn flush_mode_parses() {
        assert_eq!("inline".parse::<FlushMode>().unwrap(), FlushMode::Inline);
        assert_eq!(" Background ".parse::<FlushMode>().unwrap(), FlushMode::Background);
        assert!("later".parse::<FlushMode>().is_err());
    }
}
