//! The `validate` command: check a URL template without downloading.

use clap::Args;

use tilehaul::validate_tile_url;

use crate::error::CliError;

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Tile URL template to check
    pub template: String,

    /// Treat the template as having a configured subdomain list
    #[arg(long)]
    pub subdomains: bool,
}

pub fn run(args: ValidateArgs) -> Result<(), CliError> {
    let validation = validate_tile_url(&args.template, args.subdomains);

    if validation.valid {
        println!("template is valid");
    }
    if !validation.placeholders.is_empty() {
        println!("placeholders: {}", validation.placeholders.join(", "));
    }
    for warning in &validation.warnings {
        println!("warning: {}", warning);
    }
    if !validation.missing.is_empty() {
        return Err(CliError::Args(format!(
            "template is missing required placeholders: {}",
            validation.missing.join(", ")
        )));
    }
    Ok(())
}
