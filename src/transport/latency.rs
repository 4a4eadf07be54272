//! Rolling round-trip latency from ping/pong exchanges

use std::collections::VecDeque;
use std::time::Duration;

/// Longest round trip accepted as a sample
pub const MAX_ROUND_TRIP: Duration = Duration::from_secs(60);

/// Keeps the last `window` round-trip samples
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    samples: VecDeque<Duration>,
    window: usize,
}

impl LatencyTracker {
    pub fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    /// Record a pong for a ping sent at `sent_at` (unix ms), received at `now`.
    /// Timestamps from the future or older than [`MAX_ROUND_TRIP`] are
    /// refused and return false.
    pub fn record_pong(&mut self, sent_at: i64, now: i64) -> bool {
        match now.checked_sub(sent_at).and_then(|ms| u64::try_from(ms).ok()) {
            Some(ms) if ms <= MAX_ROUND_TRIP.as_millis() as u64 => {
                self.record(Duration::from_millis(ms));
                true
            }
            _ => false,
        }
    }

    pub fn record(&mut self, rtt: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn last(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_only_recent_samples() {
        let mut tracker = LatencyTracker::new(10);
        for ms in 1..=15u64 {
            tracker.record(Duration::from_millis(ms * 10));
        }
        assert_eq!(tracker.len(), 10);
        // samples 60..=150 remain
        assert_eq!(tracker.average(), Some(Duration::from_millis(105)));
        assert_eq!(tracker.last(), Some(Duration::from_millis(150)));
    }

    #[test]
    fn pong_timestamps_out_of_range_are_refused() {
        let mut tracker = LatencyTracker::new(3);
        assert!(!tracker.record_pong(1_000, 900));
        assert!(!tracker.record_pong(i64::MIN, 1_000));
        assert!(!tracker.record_pong(i64::MAX, i64::MIN));
        assert!(!tracker.record_pong(0, 1_000_000));
        assert!(tracker.is_empty());

        assert!(tracker.record_pong(1_000, 1_040));
        assert_eq!(tracker.last(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn empty_tracker_has_no_average() {
        assert_eq!(LatencyTracker::default().average(), None);
    }
}
