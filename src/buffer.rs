//! Detection records awaiting a durable commit.

use std::collections::VecDeque;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::detect::Detection;

/// Random bytes in a run id.
const RUN_ID_BYTES: usize = 8;

/// Where a record came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    /// Run start, seconds since the Unix epoch.
    pub run_timestamp: i64,
    /// Random per-run nonce; separates runs that start within the same second.
    pub run_id: String,
}

impl Provenance {
    /// Provenance for a new run with a fresh random `run_id`.
    pub fn new(source_id: impl Into<String>, run_timestamp: i64) -> Self {
        let mut nonce = [0u8; RUN_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            source_id: source_id.into(),
            run_timestamp,
            run_id: hex::encode(nonce),
        }
    }
}

/// The unit stored by a `PersistenceSink`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Deterministic key; stores use it to ignore replays of a batch.
    pub record_key: String,
    pub source_id: String,
    pub run_timestamp: i64,
    pub run_id: String,
    #[serde(flatten)]
    pub detection: Detection,
}

impl DetectionRecord {
    /// `ordinal` is the position of the detection inside its tick's set.
    pub fn new(detection: Detection, ordinal: usize, provenance: &Provenance) -> Self {
        let record_key = record_key(provenance, detection.frame_id, ordinal);
        Self {
            record_key,
            source_id: provenance.source_id.clone(),
            run_timestamp: provenance.run_timestamp,
            run_id: provenance.run_id.clone(),
            detection,
        }
    }
}

fn record_key(provenance: &Provenance, frame_id: u64, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provenance.source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(provenance.run_timestamp.to_le_bytes());
    hasher.update(provenance.run_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(frame_id.to_le_bytes());
    hasher.update((ordinal as u64).to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Ordered, append-only queue of pending records.
///
/// Records leave the buffer only through `drain_all`; a caller whose commit
/// failed hands the batch back with `requeue_front` so ordering is kept and
/// nothing is duplicated.
#[derive(Debug, Default)]
pub struct EventBuffer {
    records: VecDeque<DetectionRecord>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: DetectionRecord) {
        self.records.push_back(record);
    }

    pub fn extend<I: IntoIterator<Item = DetectionRecord>>(&mut self, records: I) {
        self.records.extend(records);
    }

    /// Take every pending record, oldest first, leaving the buffer empty.
    pub fn drain_all(&mut self) -> Vec<DetectionRecord> {
        self.records.drain(..).collect()
    }

    /// Put a failed batch back ahead of anything appended since.
    pub fn requeue_front(&mut self, batch: Vec<DetectionRecord>) {
        for record in batch.into_iter().rev() {
            self.records.push_front(record);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
