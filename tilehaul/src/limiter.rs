//! Minimum-interval request pacing.
//!
//! A rate limit of R tiles/second means consecutive fetch starts are spaced
//! by at least 1/R seconds. `acquire()` must be called *inside* each fetch
//! task, not in the scheduler's dispatch loop: dispatch-side pacing would
//! serialize slot acquisition and collapse effective concurrency to one,
//! while task-side pacing lets up to `concurrency` tasks queue on the
//! limiter together.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Paces acquisitions to a minimum inter-start interval.
///
/// Waiters are served in arrival order: the tokio mutex queues them FIFO,
/// and each reserves its start slot while holding the lock.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Limiter allowing `tiles_per_second` acquisitions per second.
    ///
    /// The rate must be positive; configuration validation enforces this
    /// before a limiter is ever constructed.
    pub fn per_second(tiles_per_second: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / tiles_per_second),
            next_slot: Mutex::new(None),
        }
    }

    /// Minimum spacing between acquisitions.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until this caller's start slot arrives.
    ///
    /// The first acquisition is immediate; each subsequent one is scheduled
    /// `interval` after the previous slot (or after now, when the limiter
    /// has been idle).
    pub async fn acquire(&self) {
        let wait = {
            let mut slot = self.next_slot.lock().await;
            let now = Instant::now();
            match *slot {
                None => {
                    *slot = Some(now + self.interval);
                    Duration::ZERO
                }
                Some(next) => {
                    let base = if next > now { next } else { now };
                    *slot = Some(base + self.interval);
                    next.saturating_duration_since(now)
                }
            }
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let limiter = RateLimiter::per_second(1.0);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_sequential_acquires_are_spaced() {
        let limiter = RateLimiter::per_second(50.0); // 20ms interval
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        // Two gaps of >= 20ms each.
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_concurrent_acquires_keep_spacing() {
        let limiter = Arc::new(RateLimiter::per_second(50.0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }

        let mut instants = Vec::new();
        for handle in handles {
            instants.push(handle.await.unwrap());
        }
        instants.sort();

        // 4 acquisitions spread across >= 3 intervals.
        let span = instants[3].duration_since(instants[0]);
        assert!(
            span >= Duration::from_millis(55),
            "span {:?} too short",
            span
        );
    }

    #[tokio::test]
    async fn test_idle_limiter_does_not_accumulate_credit() {
        let limiter = RateLimiter::per_second(100.0); // 10ms interval
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // After idling past the slot, the next acquire is immediate but the
        // one after it still waits a full interval.
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(5));
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
