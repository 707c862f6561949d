//! Inference tick scheduling.

/// Interval used when the source reports no frame rate.
pub const FALLBACK_INTERVAL: u32 = 30;

/// Decides which frames trigger a detector call.
///
/// Frame 1 always ticks; after that every `interval`-th frame does. With the
/// interval derived from the source frame rate this bounds detection to
/// roughly once per second of media.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InferenceScheduler {
    interval: u32,
}

impl InferenceScheduler {
    pub fn new(interval: u32) -> Self {
        Self {
            interval: interval.max(1),
        }
    }

    /// Derive the interval: an explicit interval wins, then the frame rate
    /// (rounded, at least 1), then `FALLBACK_INTERVAL`.
    pub fn from_policy(frame_rate: Option<f64>, explicit_interval: Option<u32>) -> Self {
        if let Some(interval) = explicit_interval {
            return Self::new(interval);
        }
        match frame_rate {
            Some(rate) if rate.is_finite() && rate > 0.0 => {
                Self::new(rate.round().clamp(1.0, u32::MAX as f64) as u32)
            }
            _ => Self::new(FALLBACK_INTERVAL),
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Frame numbers start at 1; frame 0 never ticks.
    pub fn is_tick(&self, frame_number: u64) -> bool {
        frame_number == 1 || (frame_number != 0 && frame_number % self.interval as u64 == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_always_ticks() {
        for interval in [1, 2, 5, 7, 30, 1000, u32::MAX] {
            assert!(InferenceScheduler::new(interval).is_tick(1));
        }
        assert!(InferenceScheduler::from_policy(None, None).is_tick(1));
        assert!(InferenceScheduler::from_policy(Some(0.2), None).is_tick(1));
    }

    #[test]
    fn ticks_on_multiples_of_interval() {
        let s = InferenceScheduler::new(5);
        let ticks: Vec<u64> = (1..=12).filter(|n| s.is_tick(*n)).collect();
        assert_eq!(ticks, vec![1, 5, 10]);
        assert!(!s.is_tick(0));
    }

    #[test]
    fn interval_follows_frame_rate() {
        assert_eq!(InferenceScheduler::from_policy(Some(29.97), None).interval(), 30);
        assert_eq!(InferenceScheduler::from_policy(Some(0.4), None).interval(), 1);
        assert_eq!(InferenceScheduler::from_policy(Some(f64::NAN), None).interval(), 30);
        assert_eq!(InferenceScheduler::from_policy(None, None).interval(), FALLBACK_INTERVAL);
    }

    #[test]
    fn explicit_interval_overrides_frame_rate() {
        assert_eq!(InferenceScheduler::from_policy(Some(60.0), Some(10)).interval(), 10);
        assert_eq!(InferenceScheduler::new(0).interval(), 1);
    }

    #[test]
    fn interval_of_one_ticks_every_frame() {
        let s = InferenceScheduler::new(1);
        assert!((1..50).all(|n| s.is_tick(n)));
    }
}
