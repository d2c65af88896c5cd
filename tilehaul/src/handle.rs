//! The public surface of a running download.
//!
//! [`DownloadHandle`] exposes the enumeration totals, the single-consumer
//! tile stream, live progress snapshots, pause/resume/cancel controls and a
//! stats future that resolves at the terminal state. The stats future
//! observes completion through the state machine's oneshot channel and never
//! touches the tile stream.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::error::DownloadError;
use crate::progress::{DownloadStats, LiveProgress, ProgressTracker};
use crate::scheduler::DownloadController;
use crate::tile::TilePayload;

/// Finite, single-consumer stream of fetched tiles.
///
/// Ends when the run reaches a terminal state; tiles arrive in completion
/// order, not enumeration order.
#[derive(Debug)]
pub struct TileStream {
    rx: mpsc::Receiver<TilePayload>,
}

impl TileStream {
    pub(crate) fn new(rx: mpsc::Receiver<TilePayload>) -> Self {
        Self { rx }
    }

    /// Receives the next tile; `None` once the run has terminated.
    pub async fn recv(&mut self) -> Option<TilePayload> {
        self.rx.recv().await
    }
}

impl Stream for TileStream {
    type Item = TilePayload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Handle to one download run.
pub struct DownloadHandle {
    total_tiles: u64,
    estimated_size: u64,
    tiles_by_zoom: BTreeMap<u8, u64>,
    stream: Option<TileStream>,
    controller: Arc<DownloadController>,
    tracker: Arc<ProgressTracker>,
    stats_rx: Option<oneshot::Receiver<Result<DownloadStats, DownloadError>>>,
}

impl DownloadHandle {
    pub(crate) fn new(
        estimated_size: u64,
        tiles_by_zoom: BTreeMap<u8, u64>,
        stream: TileStream,
        controller: Arc<DownloadController>,
        tracker: Arc<ProgressTracker>,
        stats_rx: oneshot::Receiver<Result<DownloadStats, DownloadError>>,
    ) -> Self {
        Self {
            total_tiles: tracker.total(),
            estimated_size,
            tiles_by_zoom,
            stream: Some(stream),
            controller,
            tracker,
            stats_rx: Some(stats_rx),
        }
    }

    /// Tiles this run will attempt, after dedup.
    pub fn total_tiles(&self) -> u64 {
        self.total_tiles
    }

    /// Estimated total download size in bytes.
    pub fn estimated_size(&self) -> u64 {
        self.estimated_size
    }

    /// Per-zoom tile counts, after dedup.
    pub fn tiles_by_zoom(&self) -> &BTreeMap<u8, u64> {
        &self.tiles_by_zoom
    }

    /// Takes the tile stream. The stream is single-consumer and
    /// non-restartable: the first caller gets it, later calls get `None`.
    pub fn take_tiles(&mut self) -> Option<TileStream> {
        self.stream.take()
    }

    /// Read-only snapshot of the run's current progress.
    pub fn progress(&self) -> LiveProgress {
        self.tracker.snapshot(self.controller.state())
    }

    /// Pauses dispatching. In-flight fetches drain; nothing new starts
    /// until [`resume`](Self::resume). Ignored unless downloading.
    pub fn pause(&self) {
        self.controller.pause();
    }

    /// Resumes a paused run. Ignored unless paused.
    pub fn resume(&self) {
        self.controller.resume();
    }

    /// Cancels the run: aborts in-flight fetches, clears the queue and ends
    /// the stream promptly. Idempotent.
    pub fn cancel(&self) {
        self.controller.cancel();
    }

    /// Waits for the terminal state and returns the run's statistics.
    ///
    /// Resolves `Ok` for completed and cancelled runs and
    /// `Err(DownloadError::FailureThreshold)` when the failure monitor
    /// tripped. Can be awaited once; it never consumes the tile stream.
    pub async fn stats(&mut self) -> Result<DownloadStats, DownloadError> {
        let rx = self.stats_rx.take().ok_or(DownloadError::Interrupted)?;
        rx.await.map_err(|_| DownloadError::Interrupted)?
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("total_tiles", &self.total_tiles)
            .field("estimated_size", &self.estimated_size)
            .field("state", &self.controller.state())
            .finish_non_exhaustive()
    }
}
