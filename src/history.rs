//! Sampling interval history.
//!
//! Tracks the spacing between consecutive emitted telemetry samples so the
//! driver can report an average sampling period.

use std::collections::VecDeque;

/// Number of intervals retained.
pub const MAX_NUM_TIMING_SAMPLES: usize = 10;

/// Bounded FIFO of the most recent inter-sample intervals, in seconds.
#[derive(Debug, Clone)]
pub struct SamplingHistory {
    intervals: VecDeque<f64>,
    capacity: usize,
}

impl Default for SamplingHistory {
    fn default() -> Self {
        Self::new(MAX_NUM_TIMING_SAMPLES)
    }
}

impl SamplingHistory {
    /// Creates an empty history holding at most `capacity` intervals.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            intervals: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add an interval, evicting the oldest once full.
    pub fn push(&mut self, interval_secs: f64) {
        if self.intervals.len() == self.capacity {
            self.intervals.pop_front();
        }
        self.intervals.push_back(interval_secs);
    }

    /// Arithmetic mean of the retained intervals.
    ///
    /// `None` while no interval has been recorded; an empty history means
    /// "no data yet", not a zero-latency link.
    pub fn average(&self) -> Option<f64> {
        if self.intervals.is_empty() {
            return None;
        }
        let sum: f64 = self.intervals.iter().sum();
        Some(sum / self.intervals.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Intervals from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.intervals.iter()
    }
}
