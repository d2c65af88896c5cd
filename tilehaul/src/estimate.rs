//! Pre-download size estimation.
//!
//! Samples a few tiles per zoom level and extrapolates a total from the
//! median observed size. Median, not mean: tile sizes are heavy-tailed
//! (ocean tiles compress to almost nothing, dense city tiles don't).
//! Estimation failures only degrade the estimate; they never abort a run.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::fetch::TileFetch;
use crate::tile::{TileRange, TileScheme};
use crate::url::{materialize, SubdomainRotator};

/// Assumed tile size when every sample at a zoom level fails.
pub const FALLBACK_TILE_BYTES: u64 = 15 * 1024;

/// Samples fetched per zoom level.
pub const SAMPLES_PER_ZOOM: usize = 3;

/// Wall clock per sample fetch.
pub const SAMPLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of the estimation pass.
#[derive(Debug, Clone)]
pub struct SizeEstimate {
    /// `Σ median(z) · count(z)` over all zoom levels.
    pub total_bytes: u64,
    /// Median sampled size per zoom (fallback value where sampling failed).
    pub median_by_zoom: BTreeMap<u8, u64>,
}

/// Estimates the total download size for a set of tile ranges.
///
/// For each zoom, up to [`SAMPLES_PER_ZOOM`] random coordinates are fetched
/// concurrently with a short timeout; the median of the observed sizes (or
/// [`FALLBACK_TILE_BYTES`] when nothing usable came back) is scaled by the
/// zoom's tile count.
pub async fn estimate_size(
    ranges: &[TileRange],
    template: &str,
    rotator: &SubdomainRotator,
    scheme: TileScheme,
    fetcher: &dyn TileFetch,
    cancel: &CancellationToken,
) -> SizeEstimate {
    let mut by_zoom: BTreeMap<u8, Vec<TileRange>> = BTreeMap::new();
    for range in ranges {
        by_zoom.entry(range.z).or_default().push(*range);
    }

    let mut total_bytes = 0u64;
    let mut median_by_zoom = BTreeMap::new();

    for (z, zoom_ranges) in &by_zoom {
        let count: u64 = zoom_ranges.iter().map(|r| r.count()).sum();
        if count == 0 {
            continue;
        }

        let sample_urls: Vec<String> = (0..SAMPLES_PER_ZOOM.min(count as usize))
            .map(|_| {
                let (x, y) = random_coordinate(zoom_ranges, count);
                materialize(template, x, scheme.url_y(*z, y), *z, rotator.next())
            })
            .collect();

        let attempts = sample_urls
            .iter()
            .map(|url| fetcher.fetch(url, cancel, SAMPLE_TIMEOUT));
        let sizes: Vec<u64> = join_all(attempts)
            .await
            .into_iter()
            .filter_map(|result| result.ok())
            .map(|bytes| bytes.len() as u64)
            .collect();

        let median = median(sizes).unwrap_or(FALLBACK_TILE_BYTES);
        debug!(zoom = z, tiles = count, median_bytes = median, "zoom size sampled");
        median_by_zoom.insert(*z, median);
        total_bytes += median * count;
    }

    SizeEstimate {
        total_bytes,
        median_by_zoom,
    }
}

/// Picks a uniformly random grid coordinate across a zoom's ranges.
fn random_coordinate(ranges: &[TileRange], total: u64) -> (u32, u32) {
    let mut index = rand::rng().random_range(0..total);
    for range in ranges {
        let count = range.count();
        if index < count {
            let rows = (range.max_y - range.min_y) as u64 + 1;
            let x = range.min_x + (index / rows) as u32;
            let y = range.min_y + (index % rows) as u32;
            return (x, y);
        }
        index -= count;
    }
    // Unreachable while `total` matches the ranges; fall back to the corner.
    (ranges[0].min_x, ranges[0].min_y)
}

/// Median of the samples; `None` when empty. Even counts average the two
/// middle values.
fn median(mut samples: Vec<u64>) -> Option<u64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();
    let mid = samples.len() / 2;
    if samples.len() % 2 == 1 {
        Some(samples[mid])
    } else {
        Some((samples[mid - 1] + samples[mid]) / 2)
    }
}
