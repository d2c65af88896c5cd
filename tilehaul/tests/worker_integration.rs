//! Worker message-protocol tests.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::ScriptedFetcher;
use tilehaul::{DownloadWorker, TileId, WorkerCommand, WorkerEvent};

fn config(bbox: [f64; 4], min_zoom: u8, max_zoom: u8) -> tilehaul::DownloadConfig {
    tilehaul::DownloadConfig::new(
        "osm",
        "https://tile.example/{z}/{x}/{y}.png",
        bbox,
        min_zoom,
        max_zoom,
    )
}

#[tokio::test]
async fn worker_streams_every_tile_exactly_once() {
    let fetcher = Arc::new(ScriptedFetcher::ok());
    let (client, mut events) = DownloadWorker::spawn(fetcher);

    client
        .send(WorkerCommand::StartDownload {
            id: 11,
            config: config([13.3, 52.5, 13.5, 52.6], 12, 12),
        })
        .await;

    let total = match events.recv().await.unwrap() {
        WorkerEvent::DownloadStarted {
            id,
            total_tiles,
            estimated_size,
        } => {
            assert_eq!(id, 11);
            assert!(estimated_size > 0);
            total_tiles
        }
        other => panic!("expected DOWNLOAD_STARTED, got {:?}", other),
    };

    let mut seen: HashSet<TileId> = HashSet::new();
    loop {
        match events.recv().await.unwrap() {
            WorkerEvent::TileDownloaded { id, tile } => {
                assert_eq!(id, 11);
                assert!(
                    seen.insert(TileId::new(tile.service.clone(), tile.z, tile.x, tile.y)),
                    "tile delivered twice"
                );
            }
            WorkerEvent::ProgressUpdate { .. } => {}
            WorkerEvent::DownloadComplete { id, stats } => {
                assert_eq!(id, 11);
                assert_eq!(stats.successful, total);
                assert_eq!(stats.failed, 0);
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(seen.len() as u64, total);

    // One worker per download: the channel closes after the terminal event.
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn worker_pause_and_resume_round_trip() {
    let fetcher = Arc::new(ScriptedFetcher::ok().with_delay(Duration::from_millis(5)));
    let (client, mut events) = DownloadWorker::spawn(fetcher);

    client
        .send(WorkerCommand::StartDownload {
            id: 21,
            config: config([13.0, 52.0, 13.4, 52.3], 12, 12),
        })
        .await;

    let total = match events.recv().await.unwrap() {
        WorkerEvent::DownloadStarted { total_tiles, .. } => total_tiles,
        other => panic!("expected DOWNLOAD_STARTED, got {:?}", other),
    };
    assert!(total >= 20);

    // Take a few tiles, pause, confirm the event stream goes quiet.
    let mut delivered = 0u64;
    while delivered < 5 {
        if let WorkerEvent::TileDownloaded { .. } = events.recv().await.unwrap() {
            delivered += 1;
        }
    }
    client.send(WorkerCommand::PauseDownload { id: 21 }).await;

    // Drain whatever was in flight; afterwards only progress ticks arrive.
    let mut quiet = false;
    for _ in 0..50 {
        match tokio::time::timeout(Duration::from_millis(300), events.recv()).await {
            Ok(Some(WorkerEvent::TileDownloaded { .. })) => {
                delivered += 1;
            }
            Ok(Some(WorkerEvent::ProgressUpdate { id, progress })) => {
                assert_eq!(id, 21);
                if progress.state == tilehaul::DownloadState::Paused {
                    quiet = true;
                    break;
                }
            }
            Ok(Some(other)) => panic!("unexpected event while pausing {:?}", other),
            Ok(None) => panic!("worker died while paused"),
            Err(_) => {
                quiet = true;
                break;
            }
        }
    }
    assert!(quiet, "worker never settled into the paused state");
    assert!(delivered < total);

    client.send(WorkerCommand::ResumeDownload { id: 21 }).await;
    loop {
        match events.recv().await.unwrap() {
            WorkerEvent::TileDownloaded { .. } => delivered += 1,
            WorkerEvent::ProgressUpdate { .. } => {}
            WorkerEvent::DownloadComplete { stats, .. } => {
                assert_eq!(stats.successful, total);
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(delivered, total);
}

#[tokio::test]
async fn worker_cancel_emits_cancelled_event() {
    let fetcher = Arc::new(ScriptedFetcher::ok().with_delay(Duration::from_millis(10)));
    let (client, mut events) = DownloadWorker::spawn(fetcher);

    client
        .send(WorkerCommand::StartDownload {
            id: 31,
            config: config([13.0, 52.0, 13.4, 52.3], 12, 12),
        })
        .await;
    assert!(matches!(
        events.recv().await.unwrap(),
        WorkerEvent::DownloadStarted { .. }
    ));

    client.send(WorkerCommand::CancelDownload { id: 31 }).await;

    let mut cancelled = false;
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::DownloadCancelled { id } => {
                assert_eq!(id, 31);
                cancelled = true;
            }
            WorkerEvent::TileDownloaded { .. } | WorkerEvent::ProgressUpdate { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(cancelled, "no DOWNLOAD_CANCELLED event seen");
}

#[tokio::test]
async fn worker_protocol_messages_serialize_for_transport() {
    // The protocol must survive a serialize/deserialize round trip so a
    // process boundary can sit between owner and worker.
    let command = WorkerCommand::StartDownload {
        id: 1,
        config: config([0.0, 0.0, 1.0, 1.0], 0, 1),
    };
    let wire = serde_json::to_vec(&command).unwrap();
    let back: WorkerCommand = serde_json::from_slice(&wire).unwrap();
    assert!(matches!(back, WorkerCommand::StartDownload { id: 1, .. }));

    let event = WorkerEvent::DownloadCancelled { id: 4 };
    let wire = serde_json::to_string(&event).unwrap();
    assert_eq!(wire, r#"{"type":"DOWNLOAD_CANCELLED","id":4}"#);
}
