//! Idle tracking for one pump direction

use std::time::{Duration, Instant};

/// Default idle time below which a retry happens immediately
pub const DEFAULT_BUSY_THRESHOLD: Duration = Duration::from_millis(100);

/// Default pause between retries once the busy threshold has passed
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Measures how long a direction has gone without moving any bytes
#[derive(Debug, Clone)]
pub struct StallTracker {
    last_success: Instant,
    busy_threshold: Duration,
    backoff: Duration,
}

impl StallTracker {
    pub fn new(busy_threshold: Duration, backoff: Duration) -> Self {
        Self {
            last_success: Instant::now(),
            busy_threshold,
            backoff,
        }
    }

    /// Record a transfer of at least one byte
    pub fn success(&mut self) {
        self.last_success = Instant::now();
    }

    /// Time since the last successful transfer
    pub fn idle(&self) -> Duration {
        self.last_success.elapsed()
    }

    /// Pause to take before the next retry
    ///
    /// Zero while still inside the busy threshold, the configured backoff after it.
    pub fn retry_delay(&self) -> Duration {
        if self.idle() > self.busy_threshold {
            self.backoff
        } else {
            Duration::ZERO
        }
    }

    pub fn is_stalled(&self, timeout: Duration) -> bool {
        self.idle() > timeout
    }

    /// Time left before `timeout` counts as a stall
    pub fn remaining(&self, timeout: Duration) -> Duration {
        timeout.saturating_sub(self.idle())
    }
}

impl Default for StallTracker {
    fn default() -> Self {
        Self::new(DEFAULT_BUSY_THRESHOLD, DEFAULT_RETRY_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_tracker_retries_immediately() {
        let tracker = StallTracker::default();
        assert_eq!(tracker.retry_delay(), Duration::ZERO);
        assert!(!tracker.is_stalled(Duration::from_secs(5)));
    }

    #[test]
    fn test_backoff_after_threshold() {
        let tracker = StallTracker::new(Duration::from_millis(5), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(tracker.retry_delay(), Duration::from_millis(1));
        assert!(tracker.is_stalled(Duration::from_millis(10)));
        assert_eq!(tracker.remaining(Duration::from_millis(10)), Duration::ZERO);
    }

    #[test]
    fn test_success_resets_idle() {
        let mut tracker = StallTracker::new(Duration::from_millis(5), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(15));
        tracker.success();
        assert!(tracker.idle() < Duration::from_millis(5));
        assert_eq!(tracker.retry_delay(), Duration::ZERO);
    }
}
