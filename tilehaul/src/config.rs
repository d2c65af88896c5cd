//! Download configuration.
//!
//! [`DownloadConfig`] groups everything a run needs, with builder-style
//! setters over sensible defaults. Validation happens eagerly in
//! [`DownloadConfig::validate`], before any fetch begins.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::grid::{self, MAX_ZOOM};
use crate::tile::{TileId, TileScheme};
use crate::url::{validate_template, DEFAULT_SUBDOMAINS};

/// Default CRS when the caller does not choose one.
pub const DEFAULT_CRS: &str = "EPSG:3857";

/// Concurrency bounds: at least one in-flight fetch, at most six (the
/// per-host connection budget browsers enforce, which remote tile services
/// are sized for).
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 6;
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Default retry budget per tile and base backoff delay.
pub const DEFAULT_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Per-attempt wall clock for a single tile fetch.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

fn default_crs() -> String {
    DEFAULT_CRS.to_string()
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}

/// Caller-supplied description of one download run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Opaque namespace tag carried on every tile.
    pub(crate) service_name: String,
    /// URL template with `{x}`, `{y}`, `{z}` and optionally `{s}`.
    pub(crate) url_template: String,
    /// `[min_lon, min_lat, max_lon, max_lat]` in WGS84 degrees.
    pub(crate) bbox: [f64; 4],
    pub(crate) min_zoom: u8,
    pub(crate) max_zoom: u8,
    #[serde(default = "default_crs")]
    pub(crate) crs: String,
    /// Subdomains for `{s}` rotation; `None` falls back to `a`/`b`/`c`
    /// when the template carries the placeholder.
    #[serde(default)]
    pub(crate) subdomains: Option<Vec<String>>,
    #[serde(default)]
    pub(crate) tile_scheme: TileScheme,
    #[serde(default = "default_concurrency")]
    pub(crate) concurrency: usize,
    /// Tiles per second; `None` means unlimited.
    #[serde(default)]
    pub(crate) rate_limit: Option<f64>,
    #[serde(default = "default_retries")]
    pub(crate) retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub(crate) retry_base_delay_ms: u64,
    /// Tiles the consumer already holds; these are skipped entirely.
    #[serde(default)]
    pub(crate) existing_tiles: Option<HashSet<TileId>>,
    /// GetCapabilities endpoint that auto-picks the CRS when set.
    #[serde(default)]
    pub(crate) capabilities_url: Option<String>,
}

impl DownloadConfig {
    /// Creates a configuration with the required fields; everything else
    /// takes its default.
    pub fn new(
        service_name: impl Into<String>,
        url_template: impl Into<String>,
        bbox: [f64; 4],
        min_zoom: u8,
        max_zoom: u8,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            url_template: url_template.into(),
            bbox,
            min_zoom,
            max_zoom,
            crs: default_crs(),
            subdomains: None,
            tile_scheme: TileScheme::default(),
            concurrency: DEFAULT_CONCURRENCY,
            rate_limit: None,
            retries: DEFAULT_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            existing_tiles: None,
            capabilities_url: None,
        }
    }

    pub fn with_crs(mut self, crs: impl Into<String>) -> Self {
        self.crs = crs.into();
        self
    }

    pub fn with_subdomains(mut self, subdomains: Vec<String>) -> Self {
        self.subdomains = Some(subdomains);
        self
    }

    pub fn with_tile_scheme(mut self, scheme: TileScheme) -> Self {
        self.tile_scheme = scheme;
        self
    }

    /// Concurrency is clamped to `[1, 6]` when the run starts.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_rate_limit(mut self, tiles_per_second: f64) -> Self {
        self.rate_limit = Some(tiles_per_second);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_existing_tiles(mut self, existing: HashSet<TileId>) -> Self {
        self.existing_tiles = Some(existing);
        self
    }

    pub fn with_capabilities_url(mut self, url: impl Into<String>) -> Self {
        self.capabilities_url = Some(url.into());
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn url_template(&self) -> &str {
        &self.url_template
    }

    pub fn bbox(&self) -> [f64; 4] {
        self.bbox
    }

    pub fn min_zoom(&self) -> u8 {
        self.min_zoom
    }

    pub fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    pub fn crs(&self) -> &str {
        &self.crs
    }

    pub fn tile_scheme(&self) -> TileScheme {
        self.tile_scheme
    }

    /// Effective concurrency, clamped to `[1, 6]`.
    pub fn concurrency(&self) -> usize {
        self.concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }

    pub fn rate_limit(&self) -> Option<f64> {
        self.rate_limit
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn capabilities_url(&self) -> Option<&str> {
        self.capabilities_url.as_deref()
    }

    /// Subdomains that will actually rotate through `{s}`.
    ///
    /// Empty when the template has no `{s}` slot; the configured list (or
    /// the `a`/`b`/`c` default) otherwise.
    pub fn effective_subdomains(&self) -> Vec<String> {
        if !self.url_template.contains("{s}") {
            return Vec::new();
        }
        match &self.subdomains {
            Some(subs) if !subs.is_empty() => subs.clone(),
            _ => DEFAULT_SUBDOMAINS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Rejects invalid configurations before any network activity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }

        let template = validate_template(&self.url_template, self.subdomains.is_some());
        if !template.valid {
            return Err(ConfigError::MissingPlaceholders(template.missing));
        }
        for warning in &template.warnings {
            tracing::warn!(template = %self.url_template, "{}", warning);
        }

        if self.min_zoom > self.max_zoom {
            return Err(ConfigError::ZoomOrder {
                min: self.min_zoom,
                max: self.max_zoom,
            });
        }
        if self.max_zoom > MAX_ZOOM {
            return Err(ConfigError::ZoomTooDeep(self.max_zoom, MAX_ZOOM));
        }

        grid::validate_bbox(&self.bbox)?;

        if let Some(rate) = self.rate_limit {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::InvalidRateLimit(rate));
            }
        }

        Ok(())
    }
}
