//! Background worker behind a message protocol.
//!
//! [`DownloadWorker`] runs the download facade in its own task and talks to
//! its owner exclusively through serialized command/event messages, so the
//! engine can be hosted across an isolation boundary without sharing state.
//! One worker serves one download: it waits for `START_DOWNLOAD`, drives the
//! run to a terminal state, emits the matching terminal event and exits.
//!
//! Spontaneous `PROGRESS_UPDATE` events are throttled to one per second;
//! `GET_PROGRESS` always answers immediately.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::download_tiles_with_fetcher;
use crate::fetch::TileFetch;
use crate::progress::{DownloadState, DownloadStats, LiveProgress};
use crate::tile::TilePayload;

const COMMAND_CHANNEL_CAPACITY: usize = 16;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Spacing of spontaneous progress events.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Commands the owner sends to a worker. `id` correlates responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCommand {
    StartDownload { id: u64, config: DownloadConfig },
    PauseDownload { id: u64 },
    ResumeDownload { id: u64 },
    CancelDownload { id: u64 },
    GetProgress { id: u64 },
}

/// Events a worker sends back to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEvent {
    DownloadStarted {
        id: u64,
        total_tiles: u64,
        estimated_size: u64,
    },
    ProgressUpdate {
        id: u64,
        progress: LiveProgress,
    },
    /// Ownership of the payload transfers to the owner; the worker does not
    /// retain it.
    TileDownloaded {
        id: u64,
        tile: TilePayload,
    },
    DownloadComplete {
        id: u64,
        stats: DownloadStats,
    },
    DownloadError {
        id: u64,
        error: String,
    },
    DownloadCancelled {
        id: u64,
    },
}

/// Command-side handle to a worker.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    cmd_tx: mpsc::Sender<WorkerCommand>,
}

impl WorkerClient {
    /// Sends a command; `false` when the worker has already terminated.
    pub async fn send(&self, command: WorkerCommand) -> bool {
        self.cmd_tx.send(command).await.is_ok()
    }
}

/// Spawner for download workers.
pub struct DownloadWorker;

impl DownloadWorker {
    /// Spawns a worker task bound to the given fetcher.
    ///
    /// Returns the command client and the event stream. The worker lives
    /// until its single download terminates (or the owner drops the client,
    /// which cancels the run).
    pub fn spawn(fetcher: Arc<dyn TileFetch>) -> (WorkerClient, mpsc::Receiver<WorkerEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(worker_task(fetcher, cmd_rx, event_tx));
        (WorkerClient { cmd_tx }, event_rx)
    }
}

async fn worker_task(
    fetcher: Arc<dyn TileFetch>,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    event_tx: mpsc::Sender<WorkerEvent>,
) {
    // Idle until the owner starts a download.
    let (id, config) = loop {
        match cmd_rx.recv().await {
            Some(WorkerCommand::StartDownload { id, config }) => break (id, config),
            Some(other) => warn!(command = ?other, "command ignored before download start"),
            None => {
                debug!("worker owner went away before start");
                return;
            }
        }
    };

    let mut handle = match download_tiles_with_fetcher(config, fetcher).await {
        Ok(handle) => handle,
        Err(error) => {
            let _ = event_tx
                .send(WorkerEvent::DownloadError {
                    id,
                    error: error.to_string(),
                })
                .await;
            return;
        }
    };

    let _ = event_tx
        .send(WorkerEvent::DownloadStarted {
            id,
            total_tiles: handle.total_tiles(),
            estimated_size: handle.estimated_size(),
        })
        .await;

    let Some(mut tiles) = handle.take_tiles() else {
        // A freshly created handle always still holds its stream.
        warn!("tile stream unavailable, abandoning worker");
        return;
    };

    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick resolves immediately; consume it so the cadence
    // starts one interval from now.
    ticker.tick().await;

    let mut commands_open = true;
    loop {
        tokio::select! {
            command = cmd_rx.recv(), if commands_open => match command {
                Some(WorkerCommand::PauseDownload { .. }) => handle.pause(),
                Some(WorkerCommand::ResumeDownload { .. }) => handle.resume(),
                Some(WorkerCommand::CancelDownload { .. }) => handle.cancel(),
                Some(WorkerCommand::GetProgress { id }) => {
                    let _ = event_tx
                        .send(WorkerEvent::ProgressUpdate { id, progress: handle.progress() })
                        .await;
                }
                Some(WorkerCommand::StartDownload { .. }) => {
                    warn!("download already running, start ignored");
                }
                None => {
                    // Owner dropped the client: nobody is listening, stop.
                    commands_open = false;
                    handle.cancel();
                }
            },
            tile = tiles.recv() => match tile {
                Some(payload) => {
                    let _ = event_tx
                        .send(WorkerEvent::TileDownloaded { id, tile: payload })
                        .await;
                }
                None => break,
            },
            _ = ticker.tick() => {
                let _ = event_tx
                    .send(WorkerEvent::ProgressUpdate { id, progress: handle.progress() })
                    .await;
            }
        }
    }

    let terminal = match handle.stats().await {
        Ok(stats) => {
            if handle.progress().state == DownloadState::Cancelled {
                WorkerEvent::DownloadCancelled { id }
            } else {
                WorkerEvent::DownloadComplete { id, stats }
            }
        }
        Err(error) => WorkerEvent::DownloadError {
            id,
            error: error.to_string(),
        },
    };
    let _ = event_tx.send(terminal).await;
    info!(id, "download worker terminated");
}
