//! Most-recent detection snapshot.
//!
//! The cache holds an `Arc<DetectionSet>` that is swapped wholesale at each
//! tick and never mutated in place, so a snapshot handed to the annotator can
//! not change underneath it.

use std::sync::Arc;

use crate::detect::DetectionSet;
use crate::error::CacheError;

/// Observable cache state.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheState {
    /// No tick has completed yet.
    Unset,
    /// The last tick ran and found nothing.
    Empty { tick_frame: u64 },
    /// The last tick produced detections.
    Populated(Arc<DetectionSet>),
}

impl CacheState {
    /// Detections to draw; empty for `Unset` and `Empty`.
    pub fn detections(&self) -> &[crate::detect::Detection] {
        match self {
            CacheState::Populated(set) => set.detections(),
            _ => &[],
        }
    }

    pub fn tick_frame(&self) -> Option<u64> {
        match self {
            CacheState::Unset => None,
            CacheState::Empty { tick_frame } => Some(*tick_frame),
            CacheState::Populated(set) => Some(set.frame_id()),
        }
    }
}

#[derive(Debug, Default)]
pub struct DetectionCache {
    snapshot: Option<Arc<DetectionSet>>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached set. Rejects sets stamped with a different frame.
    pub fn update(&mut self, set: DetectionSet, tick_frame: u64) -> Result<(), CacheError> {
        if set.frame_id() != tick_frame {
            return Err(CacheError::FrameMismatch {
                expected: tick_frame,
                found: set.frame_id(),
            });
        }
        self.snapshot = Some(Arc::new(set));
        Ok(())
    }

    pub fn current(&self) -> CacheState {
        match &self.snapshot {
            None => CacheState::Unset,
            Some(set) if set.is_empty() => CacheState::Empty {
                tick_frame: set.frame_id(),
            },
            Some(set) => CacheState::Populated(Arc::clone(set)),
        }
    }

    pub fn tick_frame(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|set| set.frame_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Candidate;
    use crate::frame::Frame;

    fn set_for(frame_id: u64, n: usize) -> DetectionSet {
        let frame = Frame::filled(frame_id, 0.0, 32, 32, [0, 0, 0]);
        let candidates: Vec<Candidate> = (0..n)
            .map(|i| Candidate::new("obj", 0.9, [i as f32, 0.0, 10.0, 10.0]))
            .collect();
        DetectionSet::from_candidates(&frame, &candidates, 0.0)
    }

    #[test]
    fn distinguishes_unset_empty_and_populated() {
        let mut cache = DetectionCache::new();
        assert_eq!(cache.current(), CacheState::Unset);

        cache.update(set_for(1, 0), 1).unwrap();
        assert_eq!(cache.current(), CacheState::Empty { tick_frame: 1 });
        assert!(cache.current().detections().is_empty());

        cache.update(set_for(5, 2), 5).unwrap();
        match cache.current() {
            CacheState::Populated(set) => assert_eq!(set.len(), 2),
            other => panic!("expected populated, got {:?}", other),
        }
    }

    #[test]
    fn update_replaces_whole_set() {
        let mut cache = DetectionCache::new();
        cache.update(set_for(1, 3), 1).unwrap();
        let old = cache.current();
        cache.update(set_for(30, 1), 30).unwrap();

        assert_eq!(old.detections().len(), 3);
        let current = cache.current();
        assert_eq!(current.detections().len(), 1);
        assert!(current.detections().iter().all(|d| d.frame_id == 30));
        assert_eq!(cache.tick_frame(), Some(30));
    }

    #[test]
    fn rejects_mismatched_frame_id() {
        let mut cache = DetectionCache::new();
        cache.update(set_for(1, 1), 1).unwrap();
        let err = cache.update(set_for(4, 1), 5).unwrap_err();
        assert_eq!(
            err,
            CacheError::FrameMismatch {
                expected: 5,
                found: 4
            }
        );
        assert_eq!(cache.tick_frame(), Some(1));
        assert!(cache.current().detections().iter().all(|d| d.frame_id == 1));
    }
}
