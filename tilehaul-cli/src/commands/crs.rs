//! The `crs` command: probe a GetCapabilities endpoint.

use clap::Args;

use tilehaul::{get_supported_crs, CrsSource, ServiceTypeHint};

use crate::error::CliError;

#[derive(Debug, Args)]
pub struct CrsArgs {
    /// GetCapabilities URL
    pub url: String,

    /// Service type, when the URL doesn't make it obvious: wms or wmts
    #[arg(long)]
    pub service_type: Option<ServiceTypeHint>,

    /// Print the result as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: CrsArgs) -> Result<(), CliError> {
    let resolved = get_supported_crs(&args.url, args.service_type).await;

    if args.json {
        let json = serde_json::to_string_pretty(&resolved)
            .expect("CRS result serializes to JSON");
        println!("{}", json);
        return Ok(());
    }

    match resolved.source {
        CrsSource::Assumed => {
            println!("capabilities unavailable; assuming defaults");
        }
        CrsSource::Wms => println!("WMS capabilities parsed"),
        CrsSource::Wmts => println!("WMTS capabilities parsed"),
    }
    for crs in &resolved.supported_crs {
        let marker = if *crs == resolved.default { " (default)" } else { "" };
        println!("  {}{}", crs, marker);
    }
    Ok(())
}
