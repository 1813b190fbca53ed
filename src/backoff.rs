//! Retry pacing shared by command retransmission and link supervision.

use std::time::Duration;

/// Exponential backoff helper.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    /// Creates a backoff that starts at `min`.
    ///
    /// # Arguments
    ///
    /// * `min` - First delay, and the delay after [`ExponentialBackoff::reset`].
    /// * `max` - Upper bound on any delay.
    /// * `multiplier` - Growth factor applied after each call to `next_backoff`.
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            current: min,
            min,
            max,
            multiplier,
        }
    }

    /// Returns the delay to wait now.
    ///
    /// The following call returns `current * multiplier`, capped at `max`.
    /// Command retransmission calls this once per resend; link supervision
    /// calls it once per restart.
    pub fn next_backoff(&mut self) -> Duration {
        let wait = self.current;
        self.current = std::cmp::min(
            self.max,
            Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier),
        );
        wait
    }

    /// Starts over from `min`.
    ///
    /// Supervision resets after a task has stayed up long enough to count as
    /// healthy.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(250), Duration::from_secs(1), 2.0);
        assert_eq!(backoff.next_backoff(), Duration::from_millis(250));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(500));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 3.0);
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
    }
}
