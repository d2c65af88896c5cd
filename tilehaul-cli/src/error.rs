//! CLI error handling with user-friendly messages.

use std::fmt;
use std::process;

use tilehaul::DownloadError;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line arguments.
    Args(String),
    /// The engine rejected the configuration or the run failed.
    Download(DownloadError),
    /// Failed to write a tile or directory.
    FileWrite {
        path: String,
        error: std::io::Error,
    },
}

impl CliError {
    /// Exit the process with an error message and appropriate hints.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        if let CliError::Download(DownloadError::FailureThreshold { ratio, .. }) = self {
            eprintln!();
            eprintln!(
                "More than {:.0}% of requests failed. Check the URL template, the",
                ratio * 100.0
            );
            eprintln!("service's coverage of your bounding box, and your rate limit.");
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Args(msg) => write!(f, "{}", msg),
            CliError::Download(error) => write!(f, "{}", error),
            CliError::FileWrite { path, error } => {
                write!(f, "failed to write {}: {}", path, error)
            }
        }
    }
}

impl From<DownloadError> for CliError {
    fn from(error: DownloadError) -> Self {
        CliError::Download(error)
    }
}
