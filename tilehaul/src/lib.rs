//! tilehaul - bulk map-tile download engine.
//!
//! Given a rectangular region and a zoom range, tilehaul enumerates every
//! tile the region intersects under a chosen tiling scheme, fetches them
//! with bounded concurrency and polite pacing, and streams the payloads to
//! the caller for persistence. Storage, rendering and UI are collaborators:
//! the engine never writes to disk.
//!
//! # High-Level API
//!
//! ```ignore
//! use tilehaul::{download_tiles, DownloadConfig};
//!
//! let config = DownloadConfig::new(
//!     "osm",
//!     "https://{s}.tile.example/{z}/{x}/{y}.png",
//!     [13.3, 52.5, 13.5, 52.6],
//!     12,
//!     14,
//! )
//! .with_rate_limit(8.0);
//!
//! let mut handle = download_tiles(config).await?;
//! let mut tiles = handle.take_tiles().expect("first consumer");
//! while let Some(tile) = tiles.recv().await {
//!     // persist tile.bytes under (tile.z, tile.x, tile.y)
//! }
//! let stats = handle.stats().await?;
//! ```

pub mod capabilities;
pub mod config;
pub mod enumerate;
pub mod error;
pub mod estimate;
pub mod fetch;
pub mod grid;
pub mod handle;
pub mod limiter;
pub mod monitor;
pub mod progress;
pub mod retry;
mod scheduler;
pub mod tile;
pub mod url;
pub mod worker;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::info;

pub use capabilities::{get_supported_crs, CrsSource, ServiceTypeHint, SupportedCrs};
pub use config::DownloadConfig;
pub use error::{ConfigError, DownloadError, TileError, TileErrorKind};
pub use fetch::{FetchError, ReqwestFetcher, TileFetch};
pub use handle::{DownloadHandle, TileStream};
pub use progress::{DownloadState, DownloadStats, LiveProgress};
pub use tile::{TileId, TilePayload, TileRange, TileScheme};
pub use url::TemplateValidation;
pub use worker::{DownloadWorker, WorkerClient, WorkerCommand, WorkerEvent};

use grid::{Crs, TileGrid};
use progress::ProgressTracker;
use scheduler::{DownloadController, Scheduler};
use url::SubdomainRotator;

/// Version of the tilehaul library and CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the tile output channel; bounds how far the engine can run
/// ahead of a slow consumer.
const OUTPUT_CHANNEL_CAPACITY: usize = 16;

/// Validates a tile URL template without starting a download.
pub fn validate_tile_url(template: &str, has_subdomains: bool) -> TemplateValidation {
    url::validate_template(template, has_subdomains)
}

/// Starts a download with the default HTTP fetcher.
///
/// Configuration errors surface here, before any fetch begins. The returned
/// handle carries the enumeration totals and the size estimate; the actual
/// downloading runs in the background from the moment this returns.
pub async fn download_tiles(config: DownloadConfig) -> Result<DownloadHandle, DownloadError> {
    let fetcher =
        ReqwestFetcher::new().map_err(|e| DownloadError::Client(e.to_string()))?;
    download_tiles_with_fetcher(config, Arc::new(fetcher)).await
}

/// Starts a download against a caller-supplied fetcher.
///
/// The seam the worker wrapper and the test suite use; behavior is
/// otherwise identical to [`download_tiles`].
pub async fn download_tiles_with_fetcher(
    config: DownloadConfig,
    fetcher: Arc<dyn TileFetch>,
) -> Result<DownloadHandle, DownloadError> {
    config.validate()?;

    // CRS: explicit config, or auto-picked from the service's capabilities.
    let crs_name = match config.capabilities_url() {
        Some(capabilities_url) => {
            let resolved = get_supported_crs(capabilities_url, None).await;
            info!(
                url = capabilities_url,
                crs = %resolved.default,
                source = ?resolved.source,
                "CRS auto-picked from capabilities"
            );
            resolved.default
        }
        None => config.crs().to_string(),
    };
    let crs = Crs::resolve(&crs_name)?;
    let grid = TileGrid::new(crs);

    let mut ranges = Vec::new();
    for z in config.min_zoom()..=config.max_zoom() {
        ranges.extend(grid.ranges_for_bbox(config.bbox(), z)?);
    }

    let rotator = SubdomainRotator::new(config.effective_subdomains());
    let enumerated = enumerate::enumerate_tiles(
        &ranges,
        config.service_name(),
        config.url_template(),
        &rotator,
        config.tile_scheme(),
        config.existing_tiles.as_ref(),
    );
    if enumerated.skipped_existing > 0 {
        info!(
            skipped = enumerated.skipped_existing,
            "tiles already present, skipping"
        );
    }

    let controller = Arc::new(DownloadController::new());
    let tracker = Arc::new(ProgressTracker::new(enumerated.total()));
    let cancel = controller.cancel_token();

    controller.set_state(progress::DownloadState::Estimating);
    let estimated_size = if enumerated.total() == 0 {
        0
    } else {
        estimate::estimate_size(
            &ranges,
            config.url_template(),
            &rotator,
            config.tile_scheme(),
            fetcher.as_ref(),
            &cancel,
        )
        .await
        .total_bytes
    };
    tracker.set_estimated_bytes(estimated_size);
    controller.set_state(progress::DownloadState::Downloading);

    let (tile_tx, tile_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let (stats_tx, stats_rx) = oneshot::channel();

    let scheduler = Scheduler {
        queue: enumerated.coordinates.into(),
        fetcher,
        limiter: config
            .rate_limit()
            .map(|rate| Arc::new(limiter::RateLimiter::per_second(rate))),
        retry: retry::RetryPolicy::new(config.retries(), config.retry_base_delay()),
        attempt_timeout: config::DEFAULT_ATTEMPT_TIMEOUT,
        concurrency: config.concurrency(),
        tracker: Arc::clone(&tracker),
        monitor: Arc::new(monitor::FailureMonitor::new()),
        controller: Arc::clone(&controller),
        output: tile_tx,
        stats_tx,
    };
    tokio::spawn(scheduler.run());

    info!(
        service = config.service_name(),
        total_tiles = tracker.total(),
        estimated_bytes = estimated_size,
        concurrency = config.concurrency(),
        "download started"
    );

    Ok(DownloadHandle::new(
        estimated_size,
        enumerated.by_zoom,
        TileStream::new(tile_rx),
        controller,
        tracker,
        stats_rx,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DownloadConfig {
        DownloadConfig::new(
            "osm",
            "https://tile.example/{z}/{x}/{y}.png",
            [13.3, 52.5, 13.5, 52.6],
            12,
            12,
        )
    }

    #[tokio::test]
    async fn test_config_errors_are_eager() {
        let bad = DownloadConfig::new("", "https://t.example/{z}/{x}/{y}.png", [0.0, 0.0, 1.0, 1.0], 0, 1);
        let fetcher = Arc::new(fetch::test_support::MockTileFetch::ok());
        let err = download_tiles_with_fetcher(bad, fetcher.clone()).await.unwrap_err();
        assert!(matches!(err, DownloadError::Config(ConfigError::EmptyServiceName)));
        // Nothing was fetched.
        assert_eq!(fetcher.request_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_crs_rejected() {
        let fetcher = Arc::new(fetch::test_support::MockTileFetch::ok());
        let err = download_tiles_with_fetcher(config().with_crs("EPSG:9999"), fetcher)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Config(ConfigError::UnknownCrs(_))
        ));
    }

    #[tokio::test]
    async fn test_small_run_end_to_end() {
        let fetcher = Arc::new(fetch::test_support::MockTileFetch::ok());
        let mut handle = download_tiles_with_fetcher(config(), fetcher).await.unwrap();

        assert!(handle.total_tiles() > 0);
        assert!(handle.estimated_size() > 0);

        let mut tiles = handle.take_tiles().unwrap();
        let mut yielded = 0;
        while tiles.recv().await.is_some() {
            yielded += 1;
        }
        assert_eq!(yielded, handle.total_tiles());

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.successful, handle.total_tiles());
        assert_eq!(stats.success_ratio, 1.0);
    }
}
