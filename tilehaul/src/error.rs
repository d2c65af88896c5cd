//! Error taxonomy for the download engine.
//!
//! Run-level problems ([`ConfigError`], [`DownloadError`]) are surfaced
//! eagerly or through the stats future. Per-tile problems are captured as
//! [`TileError`] records: classified, possibly retried, and on exhaustion
//! appended to the final stats without terminating the run.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::progress::DownloadStats;
use crate::tile::TileId;

/// Configuration problems detected before any fetch begins.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("service name must not be empty")]
    EmptyServiceName,

    #[error("URL template is missing required placeholders: {0:?}")]
    MissingPlaceholders(Vec<String>),

    #[error("unknown CRS `{0}`")]
    UnknownCrs(String),

    #[error("min zoom {min} exceeds max zoom {max}")]
    ZoomOrder { min: u8, max: u8 },

    #[error("zoom {0} exceeds the supported maximum of {1}")]
    ZoomTooDeep(u8, u8),

    #[error("invalid bounding box: {0}")]
    InvalidBbox(String),

    #[error("rate limit must be positive, got {0}")]
    InvalidRateLimit(f64),
}

/// Failure of a whole download run.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    /// The failure monitor tripped: more than a quarter of at least ten
    /// attempts failed. Carries the partial counts accumulated so far.
    #[error("failure threshold exceeded: {failed}/{attempts} attempts failed (ratio {ratio:.2})")]
    FailureThreshold {
        attempts: u64,
        failed: u64,
        ratio: f64,
        stats: DownloadStats,
    },

    /// The engine task went away before reaching a terminal state, or the
    /// stats future was awaited twice.
    #[error("download interrupted before a terminal state was reached")]
    Interrupted,
}

/// Classification of a per-tile failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileErrorKind {
    /// The request failed at the transport level.
    Network,
    /// The server answered with a non-success status.
    Http,
    /// The per-attempt wall clock elapsed.
    Timeout,
    /// Cross-origin rejection. Reserved for browser-hosted consumers; a
    /// native client has no same-origin policy.
    Cors,
    /// The response body is not an image.
    Parse,
    /// The run's cancellation signal fired.
    Cancelled,
    Unknown,
}

/// Record of one tile that exhausted its retry budget (or failed terminally).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileError {
    pub tile: TileId,
    pub kind: TileErrorKind,
    pub http_status: Option<u16>,
    pub message: String,
    /// Total attempts made, including the initial try.
    pub attempts: u32,
    /// Milliseconds since the Unix epoch at classification time.
    pub timestamp_ms: u64,
    /// Whether the final classification was retryable (it may still have
    /// exhausted the retry budget).
    pub retryable: bool,
}

impl TileError {
    pub fn new(
        tile: TileId,
        kind: TileErrorKind,
        http_status: Option<u16>,
        message: impl Into<String>,
        attempts: u32,
        retryable: bool,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            tile,
            kind,
            http_status,
            message: message.into(),
            attempts,
            timestamp_ms,
            retryable,
        }
    }
}
