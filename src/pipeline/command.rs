//! External-tool invocation.
//!
//! The pipeline treats "run the tool and observe its exit code" as a single
//! opaque operation: [`ToolCommand`] wraps [`tokio::process::Command`] with
//! the resolved executable path and command line, logs the launch, and hands
//! back the exit code. Stdout/stderr are inherited from the parent — output
//! capture policy belongs to whoever invokes uprez.

use anyhow::{Context, Result};

use tokio::process::Command;

/// Builder for one external-tool invocation.
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    context: Option<String>,
}

impl ToolCommand {
    /// Creates a command for the given resolved executable path.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new(), context: None }
    }

    /// Splits a fully resolved command-line string into arguments on
    /// whitespace.
    ///
    /// TODO: support quoted arguments; resolved paths containing spaces
    /// currently split.
    #[must_use]
    pub fn args_from_cmdline(mut self, cmdline: &str) -> Self {
        self.args = cmdline.split_whitespace().map(str::to_string).collect();
        self
    }

    /// Attaches a context label (typically the node name) for logging.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Spawns the tool, waits for it to exit, and returns the exit code.
    ///
    /// A child terminated by a signal has no exit code and is reported as
    /// `-1`. Failure to spawn at all (missing executable, permissions) is an
    /// error, not an exit code.
    pub async fn status(self) -> Result<i32> {
        match &self.context {
            Some(ctx) => {
                tracing::debug!("({ctx}) Executing: {} {}", self.program, self.args.join(" "));
            }
            None => tracing::debug!("Executing: {} {}", self.program, self.args.join(" ")),
        }

        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .await
            .with_context(|| format!("Failed to spawn '{}'", self.program))?;

        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_splitting() {
        let cmd = ToolCommand::new("/tools/esrgan").args_from_cmdline("-i  in.png -o out.png");
        assert_eq!(cmd.args, vec!["-i", "in.png", "-o", "out.png"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_status_reports_exit_code() {
        let code = ToolCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "exit 7".into()],
            context: None,
        }
        .status()
        .await
        .unwrap();
        assert_eq!(code, 7);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let result = ToolCommand::new("/no/such/tool").status().await;
        assert!(result.is_err());
    }
}
