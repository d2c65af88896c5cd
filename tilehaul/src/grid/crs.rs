//! Coordinate reference systems known to the engine.
//!
//! The catalog carries the two systems tile services actually serve:
//! Web Mercator (`EPSG:3857`) and geographic WGS84 (`EPSG:4326`). Input
//! bounding boxes are always WGS84 degrees; [`Crs::project`] transforms a
//! point into the target system's own units.

use std::f64::consts::PI;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::ConfigError;

/// Earth radius used by the spherical Mercator projection, in meters.
const EARTH_RADIUS: f64 = 6_378_137.0;

/// Half the Web Mercator extent: `π · R`.
const MERCATOR_ORIGIN: f64 = PI * EARTH_RADIUS;

/// Latitude bound beyond which the Mercator projection diverges.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

/// Rectangular domain of a projection in its own units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectedExtent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// A supported coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// `EPSG:3857`, spherical Web Mercator. Square extent, 2^z × 2^z tiles.
    WebMercator,
    /// `EPSG:4326`, geographic WGS84. 2:1 extent, 2^(z+1) × 2^z tiles.
    Geographic,
}

impl Crs {
    /// Resolves a CRS name in any common spelling (`EPSG:3857`,
    /// `urn:ogc:def:crs:EPSG::3857`, a bare code, …).
    pub fn resolve(name: &str) -> Result<Self, ConfigError> {
        let code = normalize_crs(name).ok_or_else(|| ConfigError::UnknownCrs(name.to_string()))?;
        match code.as_str() {
            "EPSG:3857" | "EPSG:900913" => Ok(Crs::WebMercator),
            "EPSG:4326" => Ok(Crs::Geographic),
            _ => Err(ConfigError::UnknownCrs(name.to_string())),
        }
    }

    /// Canonical identifier.
    pub fn code(&self) -> &'static str {
        match self {
            Crs::WebMercator => "EPSG:3857",
            Crs::Geographic => "EPSG:4326",
        }
    }

    /// Full extent of the projection in its own units.
    pub fn extent(&self) -> ProjectedExtent {
        match self {
            Crs::WebMercator => ProjectedExtent {
                min_x: -MERCATOR_ORIGIN,
                min_y: -MERCATOR_ORIGIN,
                max_x: MERCATOR_ORIGIN,
                max_y: MERCATOR_ORIGIN,
            },
            Crs::Geographic => ProjectedExtent {
                min_x: -180.0,
                min_y: -90.0,
                max_x: 180.0,
                max_y: 90.0,
            },
        }
    }

    /// Projects a WGS84 point into this system.
    ///
    /// Latitudes beyond the Mercator bound are clamped so polar bounding
    /// boxes stay inside the extent instead of diverging.
    #[inline]
    pub fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        match self {
            Crs::WebMercator => {
                let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
                let x = lon.to_radians() * EARTH_RADIUS;
                let y = (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() * EARTH_RADIUS;
                (x, y)
            }
            Crs::Geographic => (lon, lat),
        }
    }
}

/// Normalizes any CRS spelling to `EPSG:<code>`.
///
/// Handles `EPSG:3857`, `urn:ogc:def:crs:EPSG::3857`,
/// `http://www.opengis.net/def/crs/EPSG/0/3857` and bare numeric codes. In
/// URN and URI forms the code is the last numeric component, so the last
/// digit run in the string wins.
pub fn normalize_crs(raw: &str) -> Option<String> {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    let digits = DIGITS.get_or_init(|| Regex::new(r"\d+").expect("static regex"));

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let is_epsg = trimmed.to_ascii_lowercase().contains("epsg");
    let all_digits = trimmed.chars().all(|c| c.is_ascii_digit());
    if !is_epsg && !all_digits {
        return None;
    }

    digits
        .find_iter(trimmed)
        .last()
        .map(|m| format!("EPSG:{}", m.as_str()))
}
