//! The `run` command: drive the incremental pipelines.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Args;

use crate::batch::{Batch, discover_artifacts, slice_for_job};
use crate::core::UprezError;
use crate::manifest::{ArtifactSettings, ProcessRegistry, TransformRegistry};
use crate::tracker::FileHashCache;
use crate::vars::VarScope;

/// Root variables every run needs before anything can be resolved.
const REQUIRED_VARS: [&str; 4] = ["input.path", "output.path", "cache.path", "tools.path"];

/// Run the configured transform pipelines over the input artifacts.
///
/// Loads the process and transform registries, refreshes the registry
/// dependency snapshot, scans `{input.path}` for artifacts, takes this
/// job's slice, and runs each artifact's pipeline in order. Only
/// invocations whose dependency node changed since the previous run are
/// executed.
#[derive(Args)]
pub struct RunCommand {
    /// Resolve and report what would run, but execute nothing and persist
    /// no artifact snapshots.
    #[arg(long)]
    dry_run: bool,

    /// Variables as a ';'-separated key=value list. Must define
    /// input.path, output.path, cache.path, and tools.path.
    #[arg(short = 'a', long = "vars", default_value = "")]
    vars: String,

    /// Path to the transforms registry file.
    #[arg(long, default_value = "{tools.path}/transforms.config.json")]
    transforms: String,

    /// Path to the processes registry file.
    #[arg(long, default_value = "{tools.path}/processes.config.json")]
    processes: String,

    /// Filename pattern selecting input artifacts.
    #[arg(long, default_value = "*.png")]
    pattern: String,

    /// Hash tracked file contents instead of size + mtime. Slower, immune
    /// to timestamp-only changes.
    #[arg(long)]
    hash_content: bool,

    /// This worker's job index within the fleet split.
    #[arg(short = 'n', long, default_value_t = 0)]
    nominator: usize,

    /// Total number of fleet jobs the artifact list is split into.
    #[arg(short = 'd', long, default_value_t = 1)]
    denominator: usize,
}

impl RunCommand {
    /// Executes the run.
    pub async fn execute(self) -> Result<()> {
        let mut vars = VarScope::from_assignments(&self.vars).map_err(UprezError::Var)?;
        for required in REQUIRED_VARS {
            if !vars.contains_key(required) {
                return Err(UprezError::MissingVariable { name: required.to_string() }.into());
            }
        }
        if self.denominator == 0 || self.nominator >= self.denominator {
            bail!(
                "invalid job slice {}/{}: nominator must be < denominator",
                self.nominator,
                self.denominator
            );
        }

        let processes_path = vars.resolve_path(&self.processes).map_err(UprezError::Var)?;
        let transforms_path = vars.resolve_path(&self.transforms).map_err(UprezError::Var)?;
        let processes = ProcessRegistry::load(Path::new(&processes_path), &vars)?;
        let transforms = TransformRegistry::load(Path::new(&transforms_path))?;

        // Default settings for every artifact live next to the inputs and
        // are not optional.
        let global_path =
            vars.resolve_path("{input.path}/global.config.json").map_err(UprezError::Var)?;
        let global = ArtifactSettings::load(Path::new(&global_path))?;

        let cache = Arc::new(FileHashCache::new());
        processes.update_dependency_snapshot(&mut vars, &cache)?;

        let input_path = vars.resolve_path("{input.path}").map_err(UprezError::Var)?;
        let artifacts = discover_artifacts(Path::new(&input_path), &self.pattern)?;
        let range = slice_for_job(artifacts.len(), self.nominator, self.denominator);
        let slice = &artifacts[range];
        tracing::info!(
            "Found {} artifact(s), running {} in job {}/{}",
            artifacts.len(),
            slice.len(),
            self.nominator,
            self.denominator
        );

        let batch = Batch::new(
            &processes,
            &transforms,
            &global,
            &vars,
            cache,
            self.hash_content,
            self.dry_run,
        );
        let report = batch.run(slice).await?;
        tracing::info!(
            "Done: {} artifact(s), {} executed, {} up to date, {} without transform",
            report.completed,
            report.executed,
            report.skipped,
            report.without_transform
        );
        Ok(())
    }
}
