use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// Raw detector output in pixel coordinates of the frame it was run on.
///
/// Coordinates may fall outside the frame; they are clamped when the
/// candidate becomes a `Detection`.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub class_name: String,
    pub confidence: f32,
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl Candidate {
    pub fn new(class_name: impl Into<String>, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            x_min: bbox[0],
            y_min: bbox[1],
            x_max: bbox[2],
            y_max: bbox[3],
        }
    }
}

/// A detection produced at an inference tick. Immutable once built.
///
/// Box corners satisfy `0 <= x_min <= x_max < width` and
/// `0 <= y_min <= y_max < height` for the frame that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
    pub frame_id: u64,
    pub time_sec: f64,
}

impl Detection {
    /// Clamp a candidate into the frame bounds and stamp it with the frame.
    pub fn from_candidate(candidate: &Candidate, frame: &Frame) -> Self {
        let (x_min, x_max) = clamp_span(candidate.x_min, candidate.x_max, frame.width());
        let (y_min, y_max) = clamp_span(candidate.y_min, candidate.y_max, frame.height());
        let confidence = if candidate.confidence.is_finite() {
            candidate.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            class_name: candidate.class_name.clone(),
            confidence,
            x_min,
            y_min,
            x_max,
            y_max,
            frame_id: frame.index(),
            time_sec: frame.timestamp_sec(),
        }
    }

    pub fn box_width(&self) -> u32 {
        self.x_max - self.x_min + 1
    }

    pub fn box_height(&self) -> u32 {
        self.y_max - self.y_min + 1
    }
}

/// Clamp `[lo, hi]` into `[0, extent - 1]`, swapping reversed corners.
fn clamp_span(a: f32, b: f32, extent: u32) -> (u32, u32) {
    let max = extent.saturating_sub(1) as f32;
    let fix = |v: f32| if v.is_finite() { v.clamp(0.0, max) } else { 0.0 };
    let (a, b) = (fix(a), fix(b));
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    (lo.floor() as u32, hi.floor() as u32)
}

/// Detections from a single tick. May be empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    frame_id: u64,
    detections: Vec<Detection>,
}

impl DetectionSet {
    /// Empty result for a tick that found nothing.
    pub fn empty(frame_id: u64) -> Self {
        Self {
            frame_id,
            detections: Vec::new(),
        }
    }

    /// Build the set for `frame`, dropping candidates below `confidence_threshold`.
    pub fn from_candidates(
        frame: &Frame,
        candidates: &[Candidate],
        confidence_threshold: f32,
    ) -> Self {
        let detections = candidates
            .iter()
            .filter(|c| c.confidence.is_finite() && c.confidence >= confidence_threshold)
            .map(|c| Detection::from_candidate(c, frame))
            .collect();
        Self {
            frame_id: frame.index(),
            detections,
        }
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.detections.iter()
    }
}
