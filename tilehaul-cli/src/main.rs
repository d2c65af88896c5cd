//! tilehaul CLI - bulk tile downloads from the command line.
//!
//! The binary is thin glue over the `tilehaul` library: it parses arguments,
//! persists the tile stream to a directory (the engine itself never touches
//! disk) and prints progress. Everything interesting happens in the library.

mod commands;
mod error;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tilehaul")]
#[command(version = tilehaul::VERSION)]
#[command(about = "Bulk map-tile downloads for offline caches", long_about = None)]
struct Cli {
    /// Verbose logging (overridden by RUST_LOG when set)
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every tile of a region into a directory tree
    Fetch(commands::fetch::FetchArgs),

    /// Check a tile URL template for required placeholders
    Validate(commands::validate::ValidateArgs),

    /// Query a WMS/WMTS GetCapabilities endpoint for supported CRS
    Crs(commands::crs::CrsArgs),
}

fn init_logging(verbose: bool) {
    let default = if verbose { "tilehaul=debug" } else { "tilehaul=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Fetch(args) => commands::fetch::run(args).await,
        Commands::Validate(args) => commands::validate::run(args),
        Commands::Crs(args) => commands::crs::run(args).await,
    };

    if let Err(error) = result {
        error.exit();
    }
}
