//! Download dispatch loop and run state machine.
//!
//! One run is one [`Scheduler`] driving a FIFO queue of coordinates through
//! a bounded in-flight set. The loop owns all run state; tasks settle
//! through `JoinSet::join_next`, which removes them from the raced set at
//! settlement time, so no task outcome can ever be observed twice.
//!
//! # State machine
//!
//! ```text
//! Idle → Estimating → Downloading ⇄ Paused
//!   any non-terminal → Cancelled   (explicit cancel)
//!   Downloading → Completed        (queue empty, nothing in flight)
//!   Downloading → Failed           (failure monitor trips)
//! ```
//!
//! Pause gates spawning only: in-flight fetches drain to completion while
//! paused, so at most `concurrency` further tiles yield after `pause()`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, TileError};
use crate::fetch::TileFetch;
use crate::limiter::RateLimiter;
use crate::monitor::FailureMonitor;
use crate::progress::{DownloadState, DownloadStats, ProgressTracker};
use crate::retry::{RetryPolicy, SettledTile};
use crate::tile::{TileCoordinate, TileId, TilePayload};

/// Shared control surface for one run: state, pause wakeups and the
/// cancellation token every fetch derives from.
#[derive(Debug)]
pub(crate) struct DownloadController {
    state: Mutex<DownloadState>,
    resume: Notify,
    cancel: CancellationToken,
}

impl DownloadController {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DownloadState::Idle),
            resume: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> DownloadState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Advances the state unless a terminal state was already reached.
    pub(crate) fn set_state(&self, next: DownloadState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if !state.is_terminal() {
            *state = next;
        }
    }

    /// Pauses a downloading run. Ignored in any other state.
    pub(crate) fn pause(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == DownloadState::Downloading {
            *state = DownloadState::Paused;
            info!("download paused");
        } else {
            debug!(state = ?*state, "pause ignored");
        }
    }

    /// Resumes a paused run. Ignored in any other state.
    pub(crate) fn resume(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == DownloadState::Paused {
            *state = DownloadState::Downloading;
            drop(state);
            self.resume.notify_waiters();
            info!("download resumed");
        } else {
            debug!(state = ?*state, "resume ignored");
        }
    }

    /// Cancels the run. Idempotent; the shared token aborts every in-flight
    /// fetch and wakes the dispatch loop wherever it is suspended.
    pub(crate) fn cancel(&self) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if !state.is_terminal() {
                *state = DownloadState::Cancelled;
                info!("download cancelled");
            }
        }
        self.cancel.cancel();
        self.resume.notify_waiters();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.state() == DownloadState::Cancelled
    }

    /// Parks until the run leaves `Paused` (resume or cancellation).
    async fn wait_resume(&self) {
        loop {
            let notified = self.resume.notified();
            if self.state() != DownloadState::Paused {
                return;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = notified => {}
            }
        }
    }
}

/// The dispatch loop for one run.
pub(crate) struct Scheduler {
    pub(crate) queue: VecDeque<TileCoordinate>,
    pub(crate) fetcher: Arc<dyn TileFetch>,
    pub(crate) limiter: Option<Arc<RateLimiter>>,
    pub(crate) retry: RetryPolicy,
    pub(crate) attempt_timeout: Duration,
    pub(crate) concurrency: usize,
    pub(crate) tracker: Arc<ProgressTracker>,
    pub(crate) monitor: Arc<FailureMonitor>,
    pub(crate) controller: Arc<DownloadController>,
    pub(crate) output: mpsc::Sender<TilePayload>,
    pub(crate) stats_tx: oneshot::Sender<Result<DownloadStats, DownloadError>>,
}

impl Scheduler {
    /// Runs the dispatch loop to a terminal state.
    pub(crate) async fn run(mut self) {
        let cancel = self.controller.cancel_token();
        let mut in_flight: JoinSet<(TileId, SettledTile)> = JoinSet::new();
        let mut errors: Vec<TileError> = Vec::new();
        let mut failed_tiles: Vec<TileId> = Vec::new();

        let terminal = loop {
            if self.controller.is_cancelled() {
                break DownloadState::Cancelled;
            }
            if self.monitor.should_abort() {
                warn!(
                    attempts = self.monitor.attempts(),
                    failed = self.monitor.failed(),
                    ratio = self.monitor.failure_ratio(),
                    "failure threshold exceeded, aborting run"
                );
                break DownloadState::Failed;
            }

            let paused = self.controller.state() == DownloadState::Paused;
            if !paused {
                while in_flight.len() < self.concurrency {
                    let Some(coord) = self.queue.pop_front() else { break };
                    self.spawn_fetch(&mut in_flight, coord, &cancel);
                }
            }

            if in_flight.is_empty() {
                if self.queue.is_empty() && !paused {
                    break DownloadState::Completed;
                }
                self.controller.wait_resume().await;
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => continue,
                joined = in_flight.join_next() => {
                    match joined {
                        Some(Ok((id, settled))) => {
                            self.settle(id, settled, &mut errors, &mut failed_tiles, &cancel).await;
                        }
                        Some(Err(join_error)) => {
                            warn!(error = %join_error, "tile task panicked");
                        }
                        None => {}
                    }
                }
            }
        };

        self.finish(terminal, in_flight, errors, failed_tiles).await;
    }

    /// Starts one tile task. The coordinate moves into the task so every
    /// task owns exactly the tile it was created for.
    fn spawn_fetch(
        &self,
        in_flight: &mut JoinSet<(TileId, SettledTile)>,
        coord: TileCoordinate,
        cancel: &CancellationToken,
    ) {
        let fetcher = Arc::clone(&self.fetcher);
        let limiter = self.limiter.clone();
        let tracker = Arc::clone(&self.tracker);
        let retry = self.retry;
        let timeout = self.attempt_timeout;
        let cancel = cancel.clone();

        in_flight.spawn(async move {
            // Pacing happens inside the task: up to `concurrency` tasks
            // queue on the limiter while the dispatch loop keeps running.
            if let Some(limiter) = &limiter {
                limiter.acquire().await;
            }
            let settled = retry
                .execute(fetcher.as_ref(), &coord, &cancel, timeout, tracker.as_ref())
                .await;
            (coord.id, settled)
        });
    }

    /// Records a settled task and forwards successful payloads downstream.
    async fn settle(
        &mut self,
        id: TileId,
        settled: SettledTile,
        errors: &mut Vec<TileError>,
        failed_tiles: &mut Vec<TileId>,
        cancel: &CancellationToken,
    ) {
        match settled.result {
            Ok(bytes) => {
                self.tracker.record_success(bytes.len() as u64, settled.retried);
                self.monitor.record_outcome(true);
                let payload = TilePayload::new(&id, bytes);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(tile = %id, "payload dropped: cancelled before yield");
                    }
                    sent = self.output.send(payload) => {
                        if sent.is_err() {
                            debug!(tile = %id, "output stream dropped, continuing without yield");
                        }
                    }
                }
            }
            Err(error) => {
                self.tracker.record_failure(settled.retried);
                self.monitor.record_outcome(false);
                debug!(
                    tile = %id,
                    kind = ?error.kind,
                    attempts = error.attempts,
                    "tile failed permanently"
                );
                failed_tiles.push(id);
                errors.push(error);
            }
        }
    }

    /// Settles the terminal state: aborts leftovers, publishes stats and
    /// closes the output stream.
    async fn finish(
        self,
        terminal: DownloadState,
        mut in_flight: JoinSet<(TileId, SettledTile)>,
        errors: Vec<TileError>,
        failed_tiles: Vec<TileId>,
    ) {
        self.controller.set_state(terminal);
        if terminal != DownloadState::Completed {
            // Abort whatever is still running; aborted payloads are not
            // yielded and stay out of the counters.
            self.controller.cancel();
            in_flight.shutdown().await;
        }

        let stats = self.tracker.final_stats(errors, failed_tiles);
        info!(
            state = ?terminal,
            successful = stats.successful,
            failed = stats.failed,
            bytes = stats.actual_size,
            elapsed_ms = stats.elapsed_ms,
            "download run finished"
        );

        let result = match terminal {
            DownloadState::Failed => Err(DownloadError::FailureThreshold {
                attempts: self.monitor.attempts(),
                failed: self.monitor.failed(),
                ratio: self.monitor.failure_ratio(),
                stats,
            }),
            _ => Ok(stats),
        };
        let _ = self.stats_tx.send(result);
        // Dropping `self.output` here ends the tile stream.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::test_support::MockTileFetch;
    use crate::fetch::FetchError;
    use bytes::Bytes;

    fn coords(n: u32) -> VecDeque<TileCoordinate> {
        (0..n)
            .map(|i| TileCoordinate {
                id: TileId::new("osm", 10, i, 0),
                url: format!("https://t.example/10/{}/0.png", i),
            })
            .collect()
    }

    struct Harness {
        controller: Arc<DownloadController>,
        tracker: Arc<ProgressTracker>,
        rx: mpsc::Receiver<TilePayload>,
        stats_rx: oneshot::Receiver<Result<DownloadStats, DownloadError>>,
    }

    fn spawn_scheduler(
        queue: VecDeque<TileCoordinate>,
        fetcher: Arc<MockTileFetch>,
        concurrency: usize,
        retries: u32,
        rate_limit: Option<f64>,
    ) -> Harness {
        let total = queue.len() as u64;
        let controller = Arc::new(DownloadController::new());
        controller.set_state(DownloadState::Downloading);
        let tracker = Arc::new(ProgressTracker::new(total));
        let (tx, rx) = mpsc::channel(16);
        let (stats_tx, stats_rx) = oneshot::channel();

        let scheduler = Scheduler {
            queue,
            fetcher,
            limiter: rate_limit.map(|r| Arc::new(RateLimiter::per_second(r))),
            retry: RetryPolicy::new(retries, Duration::from_millis(1)),
            attempt_timeout: Duration::from_secs(1),
            concurrency,
            tracker: Arc::clone(&tracker),
            monitor: Arc::new(FailureMonitor::new()),
            controller: Arc::clone(&controller),
            output: tx,
            stats_tx,
        };
        tokio::spawn(scheduler.run());

        Harness {
            controller,
            tracker,
            rx,
            stats_rx,
        }
    }

    #[tokio::test]
    async fn test_completes_and_closes_stream() {
        let mock = Arc::new(MockTileFetch::ok());
        let mut h = spawn_scheduler(coords(8), mock, 3, 0, None);

        let mut yielded = 0;
        while let Some(_payload) = h.rx.recv().await {
            yielded += 1;
        }
        assert_eq!(yielded, 8);

        let stats = h.stats_rx.await.unwrap().unwrap();
        assert_eq!(stats.successful, 8);
        assert_eq!(stats.failed, 0);
        assert_eq!(h.controller.state(), DownloadState::Completed);
    }

    #[tokio::test]
    async fn test_empty_queue_completes_immediately() {
        let mock = Arc::new(MockTileFetch::ok());
        let mut h = spawn_scheduler(coords(0), mock, 3, 0, None);
        assert!(h.rx.recv().await.is_none());
        let stats = h.stats_rx.await.unwrap().unwrap();
        assert_eq!(stats.successful, 0);
        assert_eq!(stats.success_ratio, 1.0);
    }

    #[tokio::test]
    async fn test_no_coordinate_yields_twice() {
        let mock = Arc::new(MockTileFetch::ok());
        let mut h = spawn_scheduler(coords(20), mock, 6, 0, None);

        let mut seen = std::collections::HashSet::new();
        while let Some(payload) = h.rx.recv().await {
            assert!(seen.insert(payload.id()), "duplicate tile {}", payload.id());
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeded() {
        let mock = Arc::new(MockTileFetch::ok().with_delay(Duration::from_millis(10)));
        let mut h = spawn_scheduler(coords(12), Arc::clone(&mock), 3, 0, None);

        while h.rx.recv().await.is_some() {}
        h.stats_rx.await.unwrap().unwrap();

        assert!(mock.peak_in_flight() <= 3, "peak {}", mock.peak_in_flight());
        assert_eq!(mock.request_count(), 12);
    }

    #[tokio::test]
    async fn test_failed_tiles_are_counted_not_fatal() {
        let mock = Arc::new(MockTileFetch::ok());
        mock.script_url(
            "https://t.example/10/0/0.png",
            vec![Err(FetchError::Status(404))],
        );
        let mut h = spawn_scheduler(coords(4), mock, 2, 5, None);

        let mut yielded = 0;
        while h.rx.recv().await.is_some() {
            yielded += 1;
        }
        assert_eq!(yielded, 3);

        let stats = h.stats_rx.await.unwrap().unwrap();
        assert_eq!(stats.successful, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.failed_tiles, vec![TileId::new("osm", 10, 0, 0)]);
        assert_eq!(stats.errors[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_failure_threshold_transitions_to_failed() {
        let mock = Arc::new(MockTileFetch::with_default(Err(FetchError::Status(500))));
        let mut h = spawn_scheduler(coords(40), Arc::clone(&mock), 2, 0, None);

        while h.rx.recv().await.is_some() {}

        let result = h.stats_rx.await.unwrap();
        match result {
            Err(DownloadError::FailureThreshold { attempts, ratio, .. }) => {
                assert!(attempts >= 10);
                assert!(ratio > 0.25);
            }
            other => panic!("expected failure threshold, got {:?}", other.map(|s| s.successful)),
        }
        assert_eq!(h.controller.state(), DownloadState::Failed);
        // The run stopped early: nowhere near all 40 tiles were attempted.
        assert!(mock.request_count() < 40);
    }

    #[tokio::test]
    async fn test_cancel_stops_yields_and_fetches() {
        let mock = Arc::new(MockTileFetch::ok().with_delay(Duration::from_millis(20)));
        let mut h = spawn_scheduler(coords(30), Arc::clone(&mock), 2, 0, None);

        // Let a couple of tiles through, then cancel.
        let first = h.rx.recv().await;
        assert!(first.is_some());
        h.controller.cancel();
        h.controller.cancel(); // idempotent

        let mut trailing = 0;
        while h.rx.recv().await.is_some() {
            trailing += 1;
        }
        // In-flight settlements racing the cancel may still yield, but the
        // stream ends promptly and the queue is never drained.
        assert!(trailing <= 6, "trailing {}", trailing);
        assert!(mock.request_count() < 30);

        let stats = h.stats_rx.await.unwrap().unwrap();
        assert_eq!(h.controller.state(), DownloadState::Cancelled);
        assert!(stats.successful < 10);
    }

    #[tokio::test]
    async fn test_pause_gates_spawning_and_resume_completes() {
        let mock = Arc::new(MockTileFetch::ok().with_delay(Duration::from_millis(5)));
        let mut h = spawn_scheduler(coords(12), Arc::clone(&mock), 2, 0, None);

        // Take a few tiles then pause.
        for _ in 0..3 {
            assert!(h.rx.recv().await.is_some());
        }
        h.controller.pause();

        // Give the loop time to drain in-flight work while paused.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started_while_paused = mock.request_count();
        assert_eq!(h.controller.state(), DownloadState::Paused);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.request_count(), started_while_paused, "fetches started while paused");

        h.controller.resume();
        let mut yielded = 3;
        while h.rx.recv().await.is_some() {
            yielded += 1;
        }
        assert_eq!(yielded, 12);

        let stats = h.stats_rx.await.unwrap().unwrap();
        assert_eq!(stats.successful, 12);
        assert_eq!(h.controller.state(), DownloadState::Completed);
    }

    #[tokio::test]
    async fn test_rate_limit_spaces_fetch_starts() {
        let mock = Arc::new(MockTileFetch::ok());
        // 3 tiles at 50/s: at least 40ms between first and last start.
        let mut h = spawn_scheduler(coords(3), Arc::clone(&mock), 6, 0, Some(50.0));

        while h.rx.recv().await.is_some() {}
        h.stats_rx.await.unwrap().unwrap();

        let starts = mock.start_instants();
        assert_eq!(starts.len(), 3);
        let span = *starts.iter().max().unwrap() - *starts.iter().min().unwrap();
        assert!(span >= Duration::from_millis(38), "span {:?}", span);
    }

    #[tokio::test]
    async fn test_retried_tile_keeps_identity() {
        let mock = Arc::new(MockTileFetch::ok());
        mock.script_url(
            "https://t.example/10/1/0.png",
            vec![
                Err(FetchError::Status(503)),
                Ok(Bytes::from_static(b"second-try")),
            ],
        );
        let mut h = spawn_scheduler(coords(3), mock, 1, 3, None);

        let mut payloads = Vec::new();
        while let Some(p) = h.rx.recv().await {
            payloads.push(p);
        }
        let retried = payloads
            .iter()
            .find(|p| p.x == 1)
            .expect("retried tile yielded");
        assert_eq!(retried.bytes, Bytes::from_static(b"second-try"));

        let stats = h.stats_rx.await.unwrap().unwrap();
        // Errors list only exhausted failures, not recovered retries.
        assert!(stats.errors.is_empty());
        assert_eq!(stats.successful, 3);
        assert_eq!(h.tracker.retry_attempts(), 1);
    }

    #[tokio::test]
    async fn test_pause_ignored_outside_downloading() {
        let controller = DownloadController::new();
        controller.set_state(DownloadState::Downloading);
        controller.cancel();
        controller.pause();
        assert_eq!(controller.state(), DownloadState::Cancelled);
        controller.resume();
        assert_eq!(controller.state(), DownloadState::Cancelled);
    }
}
