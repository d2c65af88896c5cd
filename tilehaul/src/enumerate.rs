//! Tile enumeration.
//!
//! Expands tile ranges into concrete [`TileCoordinate`]s in deterministic
//! order: zoom ascending, then x ascending, then y ascending. Tiles already
//! held by the consumer are skipped here, before they can touch totals,
//! progress or the failure threshold.

use std::collections::{BTreeMap, HashSet};

use crate::tile::{TileCoordinate, TileId, TileRange, TileScheme};
use crate::url::{materialize, SubdomainRotator};

/// Result of enumerating a run's tile set.
#[derive(Debug)]
pub struct EnumeratedTiles {
    /// Coordinates in enumeration order, already deduplicated.
    pub coordinates: Vec<TileCoordinate>,
    /// Per-zoom counts after dedup.
    pub by_zoom: BTreeMap<u8, u64>,
    /// Tiles skipped because the consumer already holds them.
    pub skipped_existing: u64,
}

impl EnumeratedTiles {
    pub fn total(&self) -> u64 {
        self.coordinates.len() as u64
    }
}

/// Expands `ranges` into materialized coordinates.
///
/// Ranges are visited zoom ascending and, within a zoom, by ascending
/// `min_x`; ranges at the same zoom are expected to be disjoint (the grid
/// guarantees this for antimeridian splits). The TMS y-axis flip happens
/// only in the URL; grid coordinates stay scheme-native.
pub fn enumerate_tiles(
    ranges: &[TileRange],
    service: &str,
    template: &str,
    rotator: &SubdomainRotator,
    scheme: TileScheme,
    existing: Option<&HashSet<TileId>>,
) -> EnumeratedTiles {
    let mut ordered: Vec<TileRange> = ranges.to_vec();
    ordered.sort_by_key(|r| (r.z, r.min_x));

    let mut coordinates = Vec::new();
    let mut by_zoom = BTreeMap::new();
    let mut skipped_existing = 0u64;

    for range in &ordered {
        for x in range.min_x..=range.max_x {
            for y in range.min_y..=range.max_y {
                let id = TileId::new(service, range.z, x, y);
                if let Some(existing) = existing {
                    if existing.contains(&id) {
                        skipped_existing += 1;
                        continue;
                    }
                }
                let url = materialize(template, x, scheme.url_y(range.z, y), range.z, rotator.next());
                coordinates.push(TileCoordinate { id, url });
                *by_zoom.entry(range.z).or_insert(0u64) += 1;
            }
        }
    }

    EnumeratedTiles {
        coordinates,
        by_zoom,
        skipped_existing,
    }
}
