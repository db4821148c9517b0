pub(crate) mod ai;
mod cli;
pub(crate) mod cohort;
pub(crate) mod config;
mod error;
pub(crate) mod ingest;
mod logging;
pub(crate) mod model;
pub(crate) mod pipeline;
pub(crate) mod retrieve;
pub(crate) mod store;
pub(crate) mod submit;
#[cfg(test)]
mod testing;

pub(crate) use error::{AppError, AppResult};

use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error, warn};

use crate::cli::{Cli, GetVerbosity};

#[tokio::main]
async fn main() -> ExitCode {
    // Loaded before parsing so `.env` values reach the `env = ...` fallbacks.
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    let verbosity = cli.cmd.get_verbosity();
    logging::setup_logger(
        verbosity
            .is_present()
            .then(|| verbosity.tracing_level_filter()),
    );

    match dotenv {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => warn!("Ignoring malformed .env file: {e}"),
    }

    match cli.cmd.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
