//! Per-tile retry with exponential backoff.
//!
//! Each tile gets `1 + retries` attempts. A failed attempt is classified
//! first: terminal classifications (missing tiles, auth rejections,
//! non-image bodies, cancellation) exit immediately, retryable ones back off
//! for `base_delay · 2^k` before retry `k` (0-indexed).

use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{TileError, TileErrorKind};
use crate::fetch::{FetchError, TileFetch};
use crate::progress::ProgressTracker;
use crate::tile::TileCoordinate;

/// Largest backoff exponent; keeps the multiplier within `u32`.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// One tile's final outcome after the retry loop.
#[derive(Debug)]
pub struct SettledTile {
    pub result: Result<Bytes, TileError>,
    /// Attempts made, including the initial try.
    pub attempts: u32,
    /// Whether the tile entered the retrying bucket at least once.
    pub retried: bool,
}

/// Maps a fetch failure to its taxonomy kind and retryability.
///
/// Statuses outside the recognized sets fall through to `Unknown`, which is
/// retried: an unrecognized condition is more likely transient than a
/// missing tile.
pub fn classify(err: &FetchError) -> (TileErrorKind, bool) {
    match err {
        FetchError::Network(_) => (TileErrorKind::Network, true),
        FetchError::Timeout(_) => (TileErrorKind::Timeout, true),
        FetchError::Status(code) => match code {
            400 | 401 | 403 | 404 | 410 => (TileErrorKind::Http, false),
            429 | 500 | 502 | 503 | 504 => (TileErrorKind::Http, true),
            _ => (TileErrorKind::Unknown, true),
        },
        FetchError::NotAnImage(_) => (TileErrorKind::Parse, false),
        FetchError::Cancelled => (TileErrorKind::Cancelled, false),
        FetchError::Other(_) => (TileErrorKind::Unknown, true),
    }
}

fn http_status(err: &FetchError) -> Option<u16> {
    match err {
        FetchError::Status(code) => Some(*code),
        _ => None,
    }
}

/// Retry budget and pacing for one run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
        }
    }

    /// Delay before retry `k` (0-indexed): `base · 2^k`.
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let shift = retry_index.min(MAX_BACKOFF_SHIFT);
        self.base_delay.saturating_mul(1u32 << shift)
    }

    /// Fetches one tile, retrying per the classification table.
    ///
    /// `tracker` sees the tile enter the retrying bucket on its first retry
    /// and counts every backoff; the settled outcome is recorded by the
    /// caller.
    pub async fn execute(
        &self,
        fetcher: &dyn TileFetch,
        coord: &TileCoordinate,
        cancel: &CancellationToken,
        attempt_timeout: Duration,
        tracker: &ProgressTracker,
    ) -> SettledTile {
        let max_attempts = self.retries.saturating_add(1);
        let mut attempt = 1u32;
        let mut retried = false;

        loop {
            match fetcher.fetch(&coord.url, cancel, attempt_timeout).await {
                Ok(bytes) => {
                    debug!(tile = %coord.id, attempt, bytes = bytes.len(), "tile fetched");
                    return SettledTile {
                        result: Ok(bytes),
                        attempts: attempt,
                        retried,
                    };
                }
                Err(err) => {
                    let (kind, retryable) = classify(&err);
                    let will_retry = retryable && attempt < max_attempts && !cancel.is_cancelled();
                    warn!(
                        tile = %coord.id,
                        attempt,
                        error = %err,
                        retryable,
                        will_retry,
                        "tile fetch attempt failed"
                    );

                    if !will_retry {
                        let error = TileError::new(
                            coord.id.clone(),
                            kind,
                            http_status(&err),
                            err.to_string(),
                            attempt,
                            retryable,
                        );
                        return SettledTile {
                            result: Err(error),
                            attempts: attempt,
                            retried,
                        };
                    }

                    if !retried {
                        retried = true;
                        tracker.record_retry_started();
                    }
                    tracker.record_retry_attempt();

                    let delay = self.backoff_delay(attempt - 1);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            let error = TileError::new(
                                coord.id.clone(),
                                TileErrorKind::Cancelled,
                                None,
                                FetchError::Cancelled.to_string(),
                                attempt,
                                false,
                            );
                            return SettledTile {
                                result: Err(error),
                                attempts: attempt,
                                retried,
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
