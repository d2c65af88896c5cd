//! Projected tile grids.
//!
//! A [`TileGrid`] turns a projected extent into inclusive tile-index ranges
//! at a given zoom level. The grid is scheme-agnostic: XYZ, TMS and WMTS all
//! share the same matrix, and only URL materialization differs (see
//! [`crate::tile::TileScheme`]). Rows are counted from the top (north) edge
//! of the extent.

mod crs;

pub use crs::{normalize_crs, Crs, ProjectedExtent, MAX_MERCATOR_LAT};

use crate::error::ConfigError;
use crate::tile::TileRange;

/// Tile edge length in pixels. All supported services tile at 256.
pub const TILE_SIZE: u32 = 256;

/// Deepest zoom level the grid math supports.
pub const MAX_ZOOM: u8 = 22;

/// Grid math for one coordinate reference system.
#[derive(Debug, Clone, Copy)]
pub struct TileGrid {
    crs: Crs,
}

impl TileGrid {
    pub fn new(crs: Crs) -> Self {
        Self { crs }
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    /// Matrix dimensions `(columns, rows)` at a zoom level.
    ///
    /// Web Mercator is square (2^z × 2^z); the geographic grid covers a 2:1
    /// extent with 2^(z+1) × 2^z tiles.
    pub fn matrix_size(&self, z: u8) -> (u32, u32) {
        let rows = 1u32 << z;
        match self.crs {
            Crs::WebMercator => (rows, rows),
            Crs::Geographic => (rows * 2, rows),
        }
    }

    /// Inclusive tile range covering a projected extent at zoom `z`.
    ///
    /// Indices are clamped to the matrix, so an extent touching the grid
    /// boundary never produces out-of-range tiles.
    pub fn tile_range(&self, extent: &ProjectedExtent, z: u8) -> TileRange {
        let full = self.crs.extent();
        let (cols, rows) = self.matrix_size(z);
        let span_x = (full.max_x - full.min_x) / cols as f64;
        let span_y = (full.max_y - full.min_y) / rows as f64;

        let clamp_col = |v: f64| -> u32 { v.floor().clamp(0.0, (cols - 1) as f64) as u32 };
        let clamp_row = |v: f64| -> u32 { v.floor().clamp(0.0, (rows - 1) as f64) as u32 };

        let min_x = clamp_col((extent.min_x - full.min_x) / span_x);
        let max_x = clamp_col((extent.max_x - full.min_x) / span_x);
        // Row 0 sits at the top of the extent.
        let min_y = clamp_row((full.max_y - extent.max_y) / span_y);
        let max_y = clamp_row((full.max_y - extent.min_y) / span_y);

        TileRange {
            z,
            min_x,
            max_x,
            min_y,
            max_y,
        }
    }

    /// Tile ranges covering a WGS84 bounding box at zoom `z`.
    ///
    /// A box whose west edge lies east of its east edge wraps the
    /// antimeridian and is split into two disjoint ranges; they are returned
    /// ordered by `min_x` and merged back into one when they touch.
    pub fn ranges_for_bbox(&self, bbox: [f64; 4], z: u8) -> Result<Vec<TileRange>, ConfigError> {
        validate_bbox(&bbox)?;
        let [min_lon, min_lat, max_lon, max_lat] = bbox;

        if min_lon <= max_lon {
            return Ok(vec![self.lonlat_range(min_lon, min_lat, max_lon, max_lat, z)]);
        }

        // Antimeridian wrap: east of the seam first, then west of it.
        let east = self.lonlat_range(min_lon, min_lat, 180.0, max_lat, z);
        let west = self.lonlat_range(-180.0, min_lat, max_lon, max_lat, z);
        if west.max_x + 1 >= east.min_x {
            // The halves touch: collapse to one full-width range so no
            // coordinate is enumerated twice.
            let (cols, _) = self.matrix_size(z);
            return Ok(vec![TileRange {
                z,
                min_x: 0,
                max_x: cols - 1,
                min_y: east.min_y.min(west.min_y),
                max_y: east.max_y.max(west.max_y),
            }]);
        }
        Ok(vec![west, east])
    }

    fn lonlat_range(&self, min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64, z: u8) -> TileRange {
        let (x0, y0) = self.crs.project(min_lon, min_lat);
        let (x1, y1) = self.crs.project(max_lon, max_lat);
        let extent = ProjectedExtent {
            min_x: x0.min(x1),
            min_y: y0.min(y1),
            max_x: x0.max(x1),
            max_y: y0.max(y1),
        };
        self.tile_range(&extent, z)
    }
}

/// Validates a WGS84 bounding box.
///
/// Longitudes may wrap (`min_lon > max_lon` spans the antimeridian) but each
/// component must stay in range and latitudes must be strictly ordered.
pub(crate) fn validate_bbox(bbox: &[f64; 4]) -> Result<(), ConfigError> {
    let [min_lon, min_lat, max_lon, max_lat] = *bbox;
    for lon in [min_lon, max_lon] {
        if !(-180.0..=180.0).contains(&lon) {
            return Err(ConfigError::InvalidBbox(format!(
                "longitude {} outside [-180, 180]",
                lon
            )));
        }
    }
    for lat in [min_lat, max_lat] {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(ConfigError::InvalidBbox(format!(
                "latitude {} outside [-90, 90]",
                lat
            )));
        }
    }
    if min_lat >= max_lat {
        return Err(ConfigError::InvalidBbox(format!(
            "south edge {} is not below north edge {}",
            min_lat, max_lat
        )));
    }
    if min_lon == max_lon {
        return Err(ConfigError::InvalidBbox(
            "bounding box has zero width".to_string(),
        ));
    }
    Ok(())
}
