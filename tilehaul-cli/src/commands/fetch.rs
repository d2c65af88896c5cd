//! The `fetch` command: download a region into `<output>/<z>/<x>/<y>.<ext>`.
//!
//! The command plays the persistence collaborator role: it scans the output
//! directory for tiles from previous invocations and feeds them back to the
//! engine as the existing-tiles set, so interrupted downloads resume where
//! they left off.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Args;
use tracing::debug;

use tilehaul::{download_tiles, DownloadConfig, TileId, TileScheme};

use crate::error::CliError;

/// Minimum spacing between progress line refreshes.
const PROGRESS_REFRESH: Duration = Duration::from_secs(1);

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Service name used to namespace the tiles
    #[arg(long, default_value = "default")]
    pub service: String,

    /// Tile URL template with {z}/{x}/{y} and optionally {s}
    #[arg(long)]
    pub template: String,

    /// Bounding box as min_lon,min_lat,max_lon,max_lat (WGS84 degrees)
    #[arg(long, allow_hyphen_values = true)]
    pub bbox: String,

    #[arg(long)]
    pub min_zoom: u8,

    #[arg(long)]
    pub max_zoom: u8,

    /// Output directory for the z/x/y tree
    #[arg(long, default_value = "tiles")]
    pub output: PathBuf,

    /// Coordinate reference system
    #[arg(long, default_value = "EPSG:3857")]
    pub crs: String,

    /// Tiling scheme: xyz, tms or wmts
    #[arg(long, default_value = "xyz")]
    pub scheme: TileScheme,

    /// Comma-separated subdomains for {s} rotation
    #[arg(long)]
    pub subdomains: Option<String>,

    /// Concurrent fetches (clamped to 1..=6)
    #[arg(long, default_value_t = 6)]
    pub concurrency: usize,

    /// Maximum tiles per second
    #[arg(long)]
    pub rate_limit: Option<f64>,

    /// Retries per tile
    #[arg(long, default_value_t = 5)]
    pub retries: u32,

    /// GetCapabilities endpoint for CRS auto-selection
    #[arg(long)]
    pub capabilities_url: Option<String>,

    /// Redownload tiles that already exist in the output directory
    #[arg(long)]
    pub force: bool,

    /// Print final statistics as JSON on stdout
    #[arg(long)]
    pub stats_json: bool,
}

pub async fn run(args: FetchArgs) -> Result<(), CliError> {
    let bbox = parse_bbox(&args.bbox)?;
    let extension = template_extension(&args.template);

    let mut config = DownloadConfig::new(
        &args.service,
        &args.template,
        bbox,
        args.min_zoom,
        args.max_zoom,
    )
    .with_crs(&args.crs)
    .with_tile_scheme(args.scheme)
    .with_concurrency(args.concurrency)
    .with_retries(args.retries);

    if let Some(subdomains) = &args.subdomains {
        config = config.with_subdomains(subdomains.split(',').map(str::to_string).collect());
    }
    if let Some(rate) = args.rate_limit {
        config = config.with_rate_limit(rate);
    }
    if let Some(url) = &args.capabilities_url {
        config = config.with_capabilities_url(url);
    }
    if !args.force {
        let existing = scan_existing(&args.output, &args.service, args.min_zoom, args.max_zoom);
        if !existing.is_empty() {
            eprintln!("{} tiles already present, skipping them", existing.len());
            config = config.with_existing_tiles(existing);
        }
    }

    let mut handle = download_tiles(config).await?;
    eprintln!(
        "{} tiles to fetch, estimated {}",
        handle.total_tiles(),
        human_bytes(handle.estimated_size())
    );

    let mut stream = handle
        .take_tiles()
        .expect("stream is present on a fresh handle");
    let mut last_refresh: Option<Instant> = None;

    while let Some(tile) = stream.recv().await {
        let dir = args.output.join(tile.z.to_string()).join(tile.x.to_string());
        let path = dir.join(format!("{}.{}", tile.y, extension));
        fs::create_dir_all(&dir).map_err(|error| CliError::FileWrite {
            path: dir.display().to_string(),
            error,
        })?;
        fs::write(&path, &tile.bytes).map_err(|error| CliError::FileWrite {
            path: path.display().to_string(),
            error,
        })?;

        if last_refresh.map_or(true, |t| t.elapsed() >= PROGRESS_REFRESH) {
            last_refresh = Some(Instant::now());
            let p = handle.progress();
            eprint!(
                "\r{}/{} tiles, {} failed, {} ({}/s)   ",
                p.downloaded,
                p.total,
                p.failed,
                human_bytes(p.downloaded_bytes),
                human_bytes(p.current_speed as u64),
            );
        }
    }
    eprintln!();

    let stats = handle.stats().await?;
    if args.stats_json {
        let json = serde_json::to_string_pretty(&stats)
            .expect("stats serialize to JSON");
        println!("{}", json);
    } else {
        eprintln!(
            "done: {} downloaded, {} failed ({} in {:.1}s, {}/s avg)",
            stats.successful,
            stats.failed,
            human_bytes(stats.actual_size),
            stats.elapsed_ms as f64 / 1_000.0,
            human_bytes(stats.average_speed as u64),
        );
    }
    Ok(())
}

/// Parses `min_lon,min_lat,max_lon,max_lat`.
fn parse_bbox(raw: &str) -> Result<[f64; 4], CliError> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| CliError::Args(format!("invalid bounding box `{}`", raw)))?;
    let [min_lon, min_lat, max_lon, max_lat] = parts[..] else {
        return Err(CliError::Args(format!(
            "bounding box needs 4 comma-separated values, got {}",
            parts.len()
        )));
    };
    Ok([min_lon, min_lat, max_lon, max_lat])
}

/// File extension for stored tiles, taken from the template path.
fn template_extension(template: &str) -> String {
    template
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("png")
        .to_string()
}

/// Collects tiles already stored under `<output>/<z>/<x>/<y>.*`.
fn scan_existing(output: &Path, service: &str, min_zoom: u8, max_zoom: u8) -> HashSet<TileId> {
    let mut existing = HashSet::new();
    for z in min_zoom..=max_zoom {
        let zoom_dir = output.join(z.to_string());
        let Ok(columns) = fs::read_dir(&zoom_dir) else { continue };
        for column in columns.flatten() {
            let Some(x) = parse_component(&column.file_name()) else { continue };
            let Ok(rows) = fs::read_dir(column.path()) else { continue };
            for row in rows.flatten() {
                let name = row.file_name();
                let stem = Path::new(&name)
                    .file_stem()
                    .map(|s| s.to_os_string())
                    .unwrap_or_default();
                if let Some(y) = parse_component(&stem) {
                    existing.insert(TileId::new(service, z, x, y));
                }
            }
        }
    }
    debug!(count = existing.len(), "scanned existing tiles");
    existing
}

fn parse_component(name: &std::ffi::OsStr) -> Option<u32> {
    name.to_str()?.parse().ok()
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
