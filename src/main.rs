//! uprez CLI entry point.
//!
//! Parses arguments, installs the log subscriber, runs the selected
//! command, and maps failures to the exit-code contract: a failed tool's
//! exit code is propagated verbatim, configuration and validation failures
//! exit with the negative sentinel.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use uprez_cli::cli::Cli;
use uprez_cli::core::{CONFIG_FAILURE_EXIT_CODE, UprezError, user_friendly_error};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if let Err(error) = cli.execute().await {
        let code = error
            .downcast_ref::<UprezError>()
            .map_or(CONFIG_FAILURE_EXIT_CODE, UprezError::exit_code);
        user_friendly_error(error).display();
        std::process::exit(code);
    }
}
