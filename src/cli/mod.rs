//! Command-line interface for uprez.
//!
//! Two subcommands cover the tool's surface:
//!
//! - `run` — resolve configuration, discover input artifacts, and drive the
//!   incremental pipelines (optionally as one slice of a fleet-wide job
//!   split);
//! - `validate` — check the registries and transform configuration without
//!   executing anything.
//!
//! Global `--verbose`/`--quiet` flags pick the log level; `RUST_LOG` wins
//! when set, so targeted filters keep working.
//!
//! Exit codes follow the pipeline contract: `0` on full success, a failing
//! tool's exit code verbatim, and the negative sentinel for configuration
//! or validation failures.

mod run;
mod validate;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Root CLI parser.
#[derive(Parser)]
#[command(
    name = "uprez",
    about = "Incremental multi-stage pipeline runner for image transforms",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only report errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured transform pipelines over the input artifacts.
    Run(run::RunCommand),

    /// Validate registries and transforms without executing anything.
    Validate(validate::ValidateCommand),
}

impl Cli {
    /// The default log filter implied by the verbosity flags.
    #[must_use]
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }

    /// Dispatches to the selected subcommand.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Validate(cmd) => cmd.execute(),
        }
    }
}
