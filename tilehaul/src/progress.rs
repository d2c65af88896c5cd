//! Run state, progress counters and final statistics.
//!
//! [`ProgressTracker`] accumulates counters from task settlements and hands
//! out read-only [`LiveProgress`] snapshots. Speed is smoothed over a
//! sliding window: byte deltas are averaged across read gaps of at least
//! half a second, and reads inside the window hold the previous value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::TileError;
use crate::tile::TileId;

/// Minimum spacing between speed recomputations.
const SPEED_SAMPLE_WINDOW_SECS: f64 = 0.5;

/// Lifecycle of one download run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Idle,
    Estimating,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl DownloadState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Cancelled | DownloadState::Failed
        )
    }
}

/// Read-only snapshot of a run in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveProgress {
    pub state: DownloadState,
    pub downloaded: u64,
    pub failed: u64,
    pub pending: u64,
    pub retrying: u64,
    pub total: u64,
    pub downloaded_bytes: u64,
    pub estimated_bytes: u64,
    /// Fraction of tiles settled, in `[0, 1]`.
    pub percent_complete: f64,
    /// Smoothed download speed in bytes per second.
    pub current_speed: f64,
    /// Estimated seconds remaining; zero when the speed is unknown.
    pub eta_seconds: f64,
}

/// Final record of a terminal run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadStats {
    pub successful: u64,
    pub failed: u64,
    pub success_ratio: f64,
    /// Bytes actually downloaded.
    pub actual_size: u64,
    pub elapsed_ms: u64,
    /// Average speed over the run, in bytes per second.
    pub average_speed: f64,
    /// Tiles that exhausted their retry budget, with classifications.
    pub errors: Vec<TileError>,
    pub failed_tiles: Vec<TileId>,
}

/// Sliding-window speed state.
#[derive(Debug)]
struct SpeedWindow {
    last_update: Instant,
    bytes_since: u64,
    current: f64,
}

/// Counter hub shared between the dispatch loop and snapshot readers.
///
/// The settled/pending/retrying split upholds the accounting invariant
/// `downloaded + failed + pending + retrying == total` at every snapshot:
/// `pending` is derived from the other three.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    downloaded: AtomicU64,
    failed: AtomicU64,
    retrying: AtomicU64,
    downloaded_bytes: AtomicU64,
    estimated_bytes: AtomicU64,
    retry_attempts: AtomicU64,
    started: Instant,
    speed: Mutex<SpeedWindow>,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        let now = Instant::now();
        Self {
            total,
            downloaded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retrying: AtomicU64::new(0),
            downloaded_bytes: AtomicU64::new(0),
            estimated_bytes: AtomicU64::new(0),
            retry_attempts: AtomicU64::new(0),
            started: now,
            speed: Mutex::new(SpeedWindow {
                last_update: now,
                bytes_since: 0,
                current: 0.0,
            }),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn set_estimated_bytes(&self, bytes: u64) {
        self.estimated_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Marks a tile as entering its first retry: it leaves `pending` and is
    /// visible under `retrying` until it settles.
    pub fn record_retry_started(&self) {
        self.retrying.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one retry attempt (every backoff, not just the first).
    pub fn record_retry_attempt(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_attempts(&self) -> u64 {
        self.retry_attempts.load(Ordering::Relaxed)
    }

    /// Records a settled success. `was_retrying` moves the tile out of the
    /// retrying bucket instead of pending.
    pub fn record_success(&self, bytes: u64, was_retrying: bool) {
        if was_retrying {
            self.retrying.fetch_sub(1, Ordering::Relaxed);
        }
        self.downloaded.fetch_add(1, Ordering::Relaxed);
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
        if let Ok(mut window) = self.speed.lock() {
            window.bytes_since += bytes;
        }
    }

    /// Records a settled failure (retry budget exhausted or terminal error).
    pub fn record_failure(&self, was_retrying: bool) {
        if was_retrying {
            self.retrying.fetch_sub(1, Ordering::Relaxed);
        }
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Builds a read-only snapshot for the given run state.
    pub fn snapshot(&self, state: DownloadState) -> LiveProgress {
        let downloaded = self.downloaded();
        let failed = self.failed();
        let retrying = self.retrying.load(Ordering::Relaxed);
        let pending = self
            .total
            .saturating_sub(downloaded + failed + retrying);
        let downloaded_bytes = self.downloaded_bytes();
        let estimated_bytes = self.estimated_bytes.load(Ordering::Relaxed);

        let current_speed = self.sample_speed();
        let eta_seconds = if current_speed > 0.0 && estimated_bytes > downloaded_bytes {
            (estimated_bytes - downloaded_bytes) as f64 / current_speed
        } else {
            0.0
        };

        let percent_complete = if self.total == 0 {
            1.0
        } else {
            (downloaded + failed) as f64 / self.total as f64
        };

        LiveProgress {
            state,
            downloaded,
            failed,
            pending,
            retrying,
            total: self.total,
            downloaded_bytes,
            estimated_bytes,
            percent_complete,
            current_speed,
            eta_seconds,
        }
    }

    /// Whole-run statistics at a terminal state.
    pub fn final_stats(&self, errors: Vec<TileError>, failed_tiles: Vec<TileId>) -> DownloadStats {
        let successful = self.downloaded();
        let failed = self.failed();
        let settled = successful + failed;
        let success_ratio = if settled == 0 {
            1.0
        } else {
            successful as f64 / settled as f64
        };
        let actual_size = self.downloaded_bytes();
        let elapsed_ms = self.elapsed_ms();
        let average_speed = if elapsed_ms == 0 {
            0.0
        } else {
            actual_size as f64 / (elapsed_ms as f64 / 1_000.0)
        };

        DownloadStats {
            successful,
            failed,
            success_ratio,
            actual_size,
            elapsed_ms,
            average_speed,
            errors,
            failed_tiles,
        }
    }

    /// Recomputes the windowed speed when the window has elapsed; otherwise
    /// holds the previous value.
    fn sample_speed(&self) -> f64 {
        let mut window = match self.speed.lock() {
            Ok(window) => window,
            Err(_) => return 0.0,
        };
        let elapsed = window.last_update.elapsed().as_secs_f64();
        if elapsed >= SPEED_SAMPLE_WINDOW_SECS {
            window.current = window.bytes_since as f64 / elapsed;
            window.bytes_since = 0;
            window.last_update = Instant::now();
        }
        window.current
    }
}
