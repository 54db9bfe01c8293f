//! The `validate` command: check configuration without executing.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use crate::core::UprezError;
use crate::manifest::{ProcessRegistry, TransformRegistry};
use crate::vars::VarScope;

/// Validate registries and transforms without executing anything.
///
/// Checks that every executable and package file exists, every transform
/// invocation references a known process, and every invocation variable and
/// command line resolves with no `{...}` residue. All findings are
/// collected and printed; any finding makes the command fail with the
/// configuration exit code.
#[derive(Args)]
pub struct ValidateCommand {
    /// Variables as a ';'-separated key=value list (same as `run`).
    #[arg(short = 'a', long = "vars", default_value = "")]
    vars: String,

    /// Path to the transforms registry file.
    #[arg(long, default_value = "{tools.path}/transforms.config.json")]
    transforms: String,

    /// Path to the processes registry file.
    #[arg(long, default_value = "{tools.path}/processes.config.json")]
    processes: String,
}

impl ValidateCommand {
    /// Executes the validation.
    pub fn execute(self) -> Result<()> {
        let mut vars = VarScope::from_assignments(&self.vars).map_err(UprezError::Var)?;

        let processes_path = vars.resolve_path(&self.processes).map_err(UprezError::Var)?;
        let transforms_path = vars.resolve_path(&self.transforms).map_err(UprezError::Var)?;
        let processes = ProcessRegistry::load(Path::new(&processes_path), &vars)?;
        let transforms = TransformRegistry::load(Path::new(&transforms_path))?;

        let mut findings = processes.validate(&mut vars);
        findings.extend(transforms.validate(&vars, &processes));

        if findings.is_empty() {
            println!("{} configuration is valid", "✓".green());
            return Ok(());
        }

        for finding in &findings {
            eprintln!("{} {finding}", "✗".red());
        }
        Err(UprezError::ValidationFailed { count: findings.len() }.into())
    }
}
