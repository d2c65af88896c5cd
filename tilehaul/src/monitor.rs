//! Failure-threshold circuit breaker.
//!
//! Records the outcome of every post-retry attempt and trips the run when
//! the observed failure ratio exceeds a quarter across at least ten samples.
//! The sample floor avoids spurious trips on tiny runs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Minimum attempts before the monitor may trip.
pub const MIN_SAMPLES: u64 = 10;

/// Failure ratio above which the run aborts.
pub const FAILURE_RATIO_THRESHOLD: f64 = 0.25;

/// Tracks post-retry outcomes for one run.
///
/// Attempts count every settled tile, including those that succeeded after
/// retries; only tiles that exhausted their retry budget count as failed.
#[derive(Debug, Default)]
pub struct FailureMonitor {
    attempts: AtomicU64,
    failed: AtomicU64,
}

impl FailureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one settled tile.
    pub fn record_outcome(&self, success: bool) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Observed failure ratio; zero before any attempt.
    pub fn failure_ratio(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            return 0.0;
        }
        self.failed() as f64 / attempts as f64
    }

    /// True once enough samples exist and too many of them failed.
    pub fn should_abort(&self) -> bool {
        self.attempts() >= MIN_SAMPLES && self.failure_ratio() > FAILURE_RATIO_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_trip_below_sample_floor() {
        let monitor = FailureMonitor::new();
        for _ in 0..9 {
            monitor.record_outcome(false);
        }
        // Ratio is 1.0 but only 9 samples.
        assert!(!monitor.should_abort());
        assert_eq!(monitor.failure_ratio(), 1.0);
    }

    #[test]
    fn test_trips_at_floor_with_high_ratio() {
        let monitor = FailureMonitor::new();
        for _ in 0..10 {
            monitor.record_outcome(false);
        }
        assert!(monitor.should_abort());
        assert_eq!(monitor.attempts(), 10);
        assert_eq!(monitor.failed(), 10);
    }

    #[test]
    fn test_ratio_at_threshold_does_not_trip() {
        let monitor = FailureMonitor::new();
        // Exactly 25%: 3 failures out of 12.
        for _ in 0..3 {
            monitor.record_outcome(false);
        }
        for _ in 0..9 {
            monitor.record_outcome(true);
        }
        assert_eq!(monitor.attempts(), 12);
        assert!(!monitor.should_abort());
    }

    #[test]
    fn test_ratio_above_threshold_trips() {
        let monitor = FailureMonitor::new();
        // 4 of 12 = 33%.
        for _ in 0..4 {
            monitor.record_outcome(false);
        }
        for _ in 0..8 {
            monitor.record_outcome(true);
        }
        assert!(monitor.should_abort());
    }

    #[test]
    fn test_successes_dilute_the_ratio() {
        let monitor = FailureMonitor::new();
        for _ in 0..3 {
            monitor.record_outcome(false);
        }
        for _ in 0..37 {
            monitor.record_outcome(true);
        }
        assert!(monitor.failure_ratio() < 0.1);
        assert!(!monitor.should_abort());
    }

    #[test]
    fn test_empty_monitor() {
        let monitor = FailureMonitor::new();
        assert_eq!(monitor.failure_ratio(), 0.0);
        assert!(!monitor.should_abort());
    }
}
