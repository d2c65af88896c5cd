//! Tile identity and payload types.
//!
//! A tile is a 256×256 image addressed by `(service, z, x, y)` under a named
//! tiling scheme. [`TileId`] is the hashable identity used for dedup sets and
//! failure reporting; [`TileCoordinate`] adds the materialized URL; and
//! [`TilePayload`] is the fetched artifact whose ownership transfers to the
//! consumer when it is yielded from the download stream.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Convention mapping `(z, x, y)` to a canonical grid position.
///
/// `Xyz` (Google/OSM, y increases south) and `Wmts` share identical grid
/// math; `Tms` inverts the y axis when the URL is materialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileScheme {
    #[default]
    Xyz,
    Tms,
    Wmts,
}

impl TileScheme {
    /// Y coordinate to substitute into the URL template.
    ///
    /// TMS counts rows from the south edge: `y_url = 2^z - 1 - y_grid`.
    /// XYZ and WMTS use the grid row directly.
    pub fn url_y(&self, z: u8, y_grid: u32) -> u32 {
        match self {
            TileScheme::Tms => (1u32 << z) - 1 - y_grid,
            TileScheme::Xyz | TileScheme::Wmts => y_grid,
        }
    }
}

impl fmt::Display for TileScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileScheme::Xyz => write!(f, "xyz"),
            TileScheme::Tms => write!(f, "tms"),
            TileScheme::Wmts => write!(f, "wmts"),
        }
    }
}

impl FromStr for TileScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xyz" => Ok(TileScheme::Xyz),
            "tms" => Ok(TileScheme::Tms),
            "wmts" => Ok(TileScheme::Wmts),
            other => Err(format!("unknown tile scheme `{}`", other)),
        }
    }
}

/// Identity of one tile: service namespace plus grid coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileId {
    /// Opaque namespace tag supplied by the caller.
    pub service: String,
    /// Zoom level.
    pub z: u8,
    /// Column in grid space.
    pub x: u32,
    /// Row in grid space (scheme-native, before any TMS inversion).
    pub y: u32,
}

impl TileId {
    pub fn new(service: impl Into<String>, z: u8, x: u32, y: u32) -> Self {
        Self {
            service: service.into(),
            z,
            x,
            y,
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.service, self.z, self.x, self.y)
    }
}

/// One enumerated tile together with its materialized URL.
///
/// Immutable after creation; the URL already reflects subdomain rotation and
/// any scheme-dependent y-axis transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCoordinate {
    pub id: TileId,
    pub url: String,
}

/// A fetched tile image handed to the stream consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilePayload {
    pub service: String,
    pub z: u8,
    pub x: u32,
    pub y: u32,
    /// Raw image bytes; ownership transfers to the consumer on yield.
    pub bytes: Bytes,
}

impl TilePayload {
    pub fn new(id: &TileId, bytes: Bytes) -> Self {
        Self {
            service: id.service.clone(),
            z: id.z,
            x: id.x,
            y: id.y,
            bytes,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn id(&self) -> TileId {
        TileId::new(self.service.clone(), self.z, self.x, self.y)
    }
}

/// Inclusive rectangle of tile indices at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub z: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TileRange {
    /// Number of tiles covered by this range.
    pub fn count(&self) -> u64 {
        let cols = (self.max_x - self.min_x) as u64 + 1;
        let rows = (self.max_y - self.min_y) as u64 + 1;
        cols * rows
    }
}
