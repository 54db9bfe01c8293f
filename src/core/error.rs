//! Error handling for uprez.
//!
//! Two layers, following the same split the rest of the code relies on:
//!
//! 1. [`UprezError`] — strongly typed failure cases, matching the error
//!    taxonomy of the pipeline: configuration errors (unresolvable variable,
//!    unknown process reference, malformed registry), execution errors
//!    (non-zero tool exit), and I/O errors.
//! 2. [`ErrorContext`] — a display wrapper that renders an error chain with
//!    an optional suggestion for the person at the terminal.
//!
//! Two failure classes deliberately do *not* appear here: a missing prior
//! snapshot (treated as empty, forcing execution) and a file that vanishes
//! before hashing (falls back to the sentinel hash). Skip decisions never
//! raise — absence of data always means "treat as changed".

use colored::Colorize;
use std::fmt;
use thiserror::Error;

use crate::vars::VarError;

/// Exit code reported for configuration and validation failures.
///
/// Distinct from any real tool exit code, which is propagated verbatim.
pub const CONFIG_FAILURE_EXIT_CODE: i32 = -1;

/// The error type for uprez operations.
#[derive(Error, Debug)]
pub enum UprezError {
    /// A required root variable (such as `tools.path`) was not supplied.
    #[error("required variable '{name}' is not defined (pass it with --vars)")]
    MissingVariable {
        /// The missing variable name.
        name: String,
    },

    /// Variable resolution failed: unresolved reference or cycle.
    #[error(transparent)]
    Var(#[from] VarError),

    /// A transform stage references a process name absent from the registry.
    #[error(
        "transform '{transform}' stage '{stage}' invocation '{invocation}' references unknown process '{process}'"
    )]
    UnknownProcess {
        /// Transform name.
        transform: String,
        /// Stage name.
        stage: String,
        /// Invocation name inside the stage.
        invocation: String,
        /// The dangling process reference.
        process: String,
    },

    /// A registry file is missing from disk.
    #[error("registry file '{file}' does not exist")]
    RegistryNotFound {
        /// Resolved path of the missing file.
        file: String,
    },

    /// A registry file exists but could not be parsed.
    #[error("failed to parse registry file '{file}': {reason}")]
    RegistryParse {
        /// Resolved path of the offending file.
        file: String,
        /// Parser message.
        reason: String,
    },

    /// Configuration validation reported findings.
    #[error("configuration validation failed with {count} error(s)")]
    ValidationFailed {
        /// Number of findings.
        count: usize,
    },

    /// An external tool exited with a non-zero status.
    ///
    /// Fatal for the remaining pipeline of the artifact that ran it; sibling
    /// artifacts are unaffected. The exit code becomes the artifact's result.
    #[error("process '{process}' in stage '{stage}' failed with exit code {code}")]
    ProcessFailed {
        /// Invocation name.
        process: String,
        /// Stage name.
        stage: String,
        /// The tool's exit code.
        code: i32,
    },

    /// I/O error from [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error from [`serde_json::Error`].
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UprezError {
    /// Maps this error to the process exit code required by the CLI
    /// contract: a failed tool's own code, the configuration sentinel for
    /// everything else.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ProcessFailed { code, .. } => *code,
            _ => CONFIG_FAILURE_EXIT_CODE,
        }
    }
}

/// An error bundled with user-facing guidance.
///
/// Wraps any [`anyhow::Error`] and optionally carries a suggestion line that
/// is rendered below the error chain.
pub struct ErrorContext {
    /// The underlying error.
    pub error: anyhow::Error,
    /// A short "try this" hint, when one exists.
    pub suggestion: Option<String>,
}

impl ErrorContext {
    /// Wraps an error without a suggestion.
    #[must_use]
    pub fn new(error: anyhow::Error) -> Self {
        Self { error, suggestion: None }
    }

    /// Attaches a suggestion line.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Prints the error chain and suggestion to stderr, colorized.
    pub fn display(&self) {
        eprintln!("{} {}", "Error:".red().bold(), self.error);
        for cause in self.error.chain().skip(1) {
            eprintln!("  {} {}", "Caused by:".yellow(), cause);
        }
        if let Some(suggestion) = &self.suggestion {
            eprintln!("\n{} {}", "Suggestion:".cyan().bold(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }
        Ok(())
    }
}

/// Converts any error into an [`ErrorContext`] with a suggestion matched to
/// the failure class.
#[must_use]
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    let suggestion = match error.downcast_ref::<UprezError>() {
        Some(UprezError::MissingVariable { name }) => {
            Some(format!("Define it on the command line, e.g. --vars \"{name}=/some/path\""))
        }
        Some(UprezError::Var(VarError::Unresolved { key, .. })) => Some(format!(
            "Define '{key}' in the transform/process vars, the artifact settings, or --vars"
        )),
        Some(UprezError::Var(VarError::Cycle { .. })) => {
            Some("Check the configuration for variables that reference each other".to_string())
        }
        Some(UprezError::UnknownProcess { process, .. }) => {
            Some(format!("Add a '{process}' entry to the processes registry, or fix the reference"))
        }
        Some(UprezError::RegistryNotFound { .. }) => {
            Some("Check the --transforms/--processes paths and the tools.path variable".to_string())
        }
        Some(UprezError::ValidationFailed { .. }) => {
            Some("Run 'uprez validate' for the full list of findings".to_string())
        }
        _ => None,
    };

    let ctx = ErrorContext::new(error);
    match suggestion {
        Some(s) => ctx.with_suggestion(s),
        None => ctx,
    }
}
