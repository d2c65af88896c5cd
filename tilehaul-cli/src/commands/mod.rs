//! CLI command implementations.
//!
//! - [`fetch`] - download a region and persist the tile stream
//! - [`validate`] - URL template checks
//! - [`crs`] - GetCapabilities CRS probe

pub mod crs;
pub mod fetch;
pub mod validate;
