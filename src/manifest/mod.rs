//! Registry and settings files consumed by the pipeline.
//!
//! Three JSON collaborators feed a run, all read-only for its duration:
//!
//! - the **process registry** (`processes.config.json`): maps a process name
//!   to an executable, a package file list (glob patterns allowed), and
//!   default variables;
//! - the **transform registry** (`transforms.config.json`): named transforms,
//!   each an ordered list of stages, each an ordered list of
//!   process-invocations with a thread tag, variables, and a command-line
//!   template;
//! - **artifact settings** (`global.config.json` plus optional per-artifact
//!   `<artifact>.json` sidecars): plain variable bags merged into each
//!   artifact's scope.
//!
//! The module also owns the process-registry snapshot pass: a shared
//! dependency snapshot over every process's package files which refreshes
//! the per-process `process.<name>.node.json` files that pipeline nodes
//! track content-hashed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::core::UprezError;
use crate::tracker::{FileHashCache, Snapshot, SnapshotBuilder};
use crate::utils::fs::{atomic_write, normalize_slashes};
use crate::vars::VarScope;

/// One entry of the process registry.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessSpec {
    /// Registry key referenced by transform invocations.
    pub name: String,
    /// Human description, informational only.
    #[serde(default)]
    pub description: String,
    /// Executable path relative to `{tools.path}`.
    pub executable: String,
    /// Files the tool consists of, relative to `{tools.path}`; entries may
    /// carry glob patterns (including `**`).
    #[serde(default)]
    pub package: Vec<String>,
    /// Default variables contributed to every invocation of this process.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl ProcessSpec {
    /// Path template of this process's persisted node file.
    ///
    /// The node file carries the package hash and executable reference; it
    /// is rewritten whenever the package changes, and pipeline nodes track
    /// it content-hashed so a tool update invalidates everything that runs
    /// the tool.
    #[must_use]
    pub fn node_file_template(&self) -> String {
        format!("{{cache.path}}/process.{}.node.json", self.name)
    }

    /// Snapshot node name for this process.
    #[must_use]
    pub fn node_name(&self) -> String {
        format!("process.{}", self.name)
    }

    /// Expands glob patterns in the package list against the real tools
    /// directory, turning every match back into a `{tools.path}/...`
    /// template. Non-glob entries are kept as-is whether or not the file
    /// exists — a missing file hashes to the sentinel and shows up as a
    /// change once it appears.
    fn expand_package_paths(&mut self, vars: &VarScope) -> Result<(), UprezError> {
        let tools_path = normalize_slashes(&vars.resolve_path("{tools.path}")?);
        let prefix = format!("{tools_path}/");

        let mut expanded = Vec::new();
        for rel in &self.package {
            if !rel.contains('*') {
                expanded.push(format!("{{tools.path}}/{rel}"));
                continue;
            }
            let pattern = vars.resolve_path(&format!("{tools_path}/{rel}"))?;
            let Ok(matches) = glob::glob(&pattern) else {
                tracing::warn!("Process '{}' has an invalid package pattern '{rel}'", self.name);
                continue;
            };
            for path in matches.flatten() {
                let path = normalize_slashes(&path.display().to_string());
                if let Some(suffix) = path.strip_prefix(&prefix) {
                    expanded.push(format!("{{tools.path}}/{suffix}"));
                }
            }
        }
        self.package = expanded;
        Ok(())
    }
}

/// The process registry: every external tool a transform may invoke.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessRegistry {
    /// Registry entries in file order.
    #[serde(rename = "processes")]
    pub processes: Vec<ProcessSpec>,
}

impl ProcessRegistry {
    /// Loads and parses the registry, expanding package globs.
    ///
    /// # Errors
    ///
    /// [`UprezError::RegistryNotFound`] if the file is absent,
    /// [`UprezError::RegistryParse`] on malformed JSON, resolution errors
    /// while expanding package paths.
    pub fn load(path: &Path, vars: &VarScope) -> Result<Self, UprezError> {
        let mut registry: Self = read_registry_json(path)?;
        for process in &mut registry.processes {
            process.expand_package_paths(vars)?;
        }
        Ok(registry)
    }

    /// Looks up a process by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProcessSpec> {
        self.processes.iter().find(|p| p.name == name)
    }

    /// Builds the shared registry snapshot and refreshes node files.
    ///
    /// For every process, a node `process.<name>` over its package files is
    /// registered and compared against `{cache.path}/processes.dep.json`
    /// from the previous run. A changed (or never-seen) node rewrites the
    /// process's `process.<name>.node.json`; the node file's content hash is
    /// primed into the run cache either way. The fresh snapshot is saved
    /// unconditionally, and `process.<name>.hash` is bound into `vars` for
    /// use by transform configuration.
    pub fn update_dependency_snapshot(
        &self,
        vars: &mut VarScope,
        cache: &Arc<FileHashCache>,
    ) -> anyhow::Result<()> {
        let snapshot_path =
            vars.resolve_path("{cache.path}/processes.dep.json").map_err(UprezError::Var)?;
        let stored = Snapshot::load(Path::new(&snapshot_path));
        let builder = SnapshotBuilder::new(Arc::clone(cache), false);

        for process in &self.processes {
            let mut files = Vec::new();
            for template in &process.package {
                files.push(vars.resolve_path(template).map_err(UprezError::Var)?);
            }
            files.sort();
            files.dedup();

            let node_name = process.node_name();
            let hash = builder.add_group(&node_name, &files, &[]);
            let identical = stored.is_identical(&node_name, &builder);

            let node_file =
                vars.resolve_path(&process.node_file_template()).map_err(UprezError::Var)?;
            if !identical || !Path::new(&node_file).exists() {
                let contents = serde_json::json!({
                    "hash": hash,
                    "exec": process.executable,
                });
                atomic_write(
                    Path::new(&node_file),
                    serde_json::to_string_pretty(&contents)?.as_bytes(),
                )?;
                tracing::debug!("Refreshed process node file '{node_file}'");
            }
            cache.get_or_compute(&node_file, true);

            vars.add(&format!("process.{}.hash", process.name), &hash, true);
        }

        builder.save(Path::new(&snapshot_path))?;
        Ok(())
    }

    /// Validates the registry against the filesystem.
    ///
    /// Collects (rather than stops at) findings: undefined or missing
    /// `tools.path`, executables that don't resolve to files, package files
    /// that don't exist. As in a real run, each process's default vars are
    /// folded into `vars` so transform validation sees them.
    pub fn validate(&self, vars: &mut VarScope) -> Vec<String> {
        let mut findings = Vec::new();

        let tools_path = match vars.resolve_path("{tools.path}") {
            Ok(path) => path,
            Err(_) => {
                findings.push("'tools.path' is not defined as a variable".to_string());
                String::new()
            }
        };
        if !tools_path.is_empty() && !Path::new(&tools_path).is_dir() {
            findings.push(format!("tools.path '{tools_path}' does not exist"));
        }

        for process in &self.processes {
            match vars.resolve_path(&format!("{{tools.path}}/{}", process.executable)) {
                Ok(executable) if Path::new(&executable).is_file() => {}
                Ok(executable) => findings.push(format!(
                    "process '{}' has a non-existing executable '{executable}'",
                    process.name
                )),
                Err(err) => findings.push(format!(
                    "process '{}' has an unresolvable executable path: {err}",
                    process.name
                )),
            }

            for package_file in &process.package {
                match vars.resolve_path(package_file) {
                    Ok(path) if Path::new(&path).is_file() => {}
                    Ok(path) => findings.push(format!(
                        "process '{}' has a non-existing package file '{path}'",
                        process.name
                    )),
                    Err(err) => findings.push(format!(
                        "process '{}' has an unresolvable package file: {err}",
                        process.name
                    )),
                }
            }

            for (key, value) in &process.vars {
                vars.add(key, value, true);
            }
        }
        findings
    }
}

/// One process-invocation inside a transform stage.
#[derive(Debug, Clone, Deserialize)]
pub struct InvocationSpec {
    /// Invocation name, unique within its stage; part of the node name.
    pub name: String,
    /// Thread-affinity tag: invocations sharing a tag run sequentially,
    /// different tags may run concurrently within the stage.
    #[serde(default = "default_thread")]
    pub thread: String,
    /// Variables declared by this invocation.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Name of the registry process to execute.
    pub process: String,
    /// Command-line template, resolved through the process scope.
    #[serde(default)]
    pub cmdline: String,
}

fn default_thread() -> String {
    "main".to_string()
}

/// An ordered set of invocations sharing one input scope.
#[derive(Debug, Clone, Deserialize)]
pub struct StageSpec {
    /// Stage name; part of the node name.
    pub name: String,
    /// Invocations in declared order.
    #[serde(default)]
    pub processes: Vec<InvocationSpec>,
}

/// A named ordered list of stages.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformSpec {
    /// Transform name, referenced by the `{transform}` artifact variable.
    pub name: String,
    /// Stages in execution order.
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

/// The transform registry.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformRegistry {
    /// Registry entries in file order.
    #[serde(rename = "transforms")]
    pub transforms: Vec<TransformSpec>,
}

impl TransformRegistry {
    /// Loads and parses the registry.
    pub fn load(path: &Path) -> Result<Self, UprezError> {
        read_registry_json(path)
    }

    /// Looks up a transform by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TransformSpec> {
        self.transforms.iter().find(|t| t.name == name)
    }

    /// Validates every transform without executing anything.
    ///
    /// Walks transforms the way a run would — accumulating stage scopes in
    /// declared order — and reports invocations that reference unknown
    /// processes or whose variables / command line cannot be fully resolved.
    /// Placeholder seed bindings stand in for the per-artifact values a real
    /// run provides.
    pub fn validate(&self, root: &VarScope, processes: &ProcessRegistry) -> Vec<String> {
        let mut findings = Vec::new();

        let mut seed = root.clone();
        seed.add("transform", "default", false);
        for (key, value) in crate::pipeline::seed_bindings("texture.png") {
            seed.add(&key, &value, false);
        }

        for transform in &self.transforms {
            let mut pipeline_vars = seed.clone();
            for stage in &transform.stages {
                let mut stage_vars = pipeline_vars.clone();
                for invocation in &stage.processes {
                    if processes.get(&invocation.process).is_none() {
                        findings.push(format!(
                            "transform '{}' stage '{}' invocation '{}' references unknown process '{}'",
                            transform.name, stage.name, invocation.name, invocation.process
                        ));
                    }

                    for (key, value) in &invocation.vars {
                        match stage_vars.try_resolve(value) {
                            Ok(resolved) if !VarScope::contains_vars(&resolved) => {
                                stage_vars.add(key, &resolved, true);
                            }
                            Ok(resolved) => findings.push(format!(
                                "transform '{}' stage '{}' invocation '{}' var '{key}' cannot be fully resolved: \"{resolved}\"",
                                transform.name, stage.name, invocation.name
                            )),
                            Err(err) => findings.push(format!(
                                "transform '{}' stage '{}' invocation '{}' var '{key}': {err}",
                                transform.name, stage.name, invocation.name
                            )),
                        }
                    }

                    match stage_vars.try_resolve(&invocation.cmdline) {
                        Ok(cmdline) if !VarScope::contains_vars(&cmdline) => {}
                        Ok(cmdline) => findings.push(format!(
                            "transform '{}' stage '{}' invocation '{}' command line cannot be fully resolved: \"{cmdline}\"",
                            transform.name, stage.name, invocation.name
                        )),
                        Err(err) => findings.push(format!(
                            "transform '{}' stage '{}' invocation '{}' command line: {err}",
                            transform.name, stage.name, invocation.name
                        )),
                    }
                }
                pipeline_vars.merge(&stage_vars, false);
            }
        }
        findings
    }
}

/// A plain variable bag: the shape of `global.config.json` and per-artifact
/// sidecar files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactSettings {
    /// Variables to merge into the artifact scope.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl ArtifactSettings {
    /// Loads settings from a file that must exist.
    pub fn load(path: &Path) -> Result<Self, UprezError> {
        read_registry_json(path)
    }

    /// Loads settings from an optional file.
    ///
    /// A missing file yields defaults; a malformed file is logged and also
    /// yields defaults, so a broken sidecar degrades to "no overrides"
    /// rather than killing the artifact.
    #[must_use]
    pub fn load_optional(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!("Ignoring unreadable settings '{}': {err}", path.display());
                Self::default()
            }
        }
    }

    /// Merges the settings variables into `scope` under the given policy.
    pub fn merge_into(&self, scope: &mut VarScope, overwrite: bool) {
        for (key, value) in &self.vars {
            scope.add(key, value, overwrite);
        }
    }
}

/// Reads and deserializes a JSON collaborator file with the registry error
/// taxonomy: missing file and parse failure are distinct configuration
/// errors.
fn read_registry_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, UprezError> {
    if !path.exists() {
        return Err(UprezError::RegistryNotFound { file: path.display().to_string() });
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|err| UprezError::RegistryParse {
        file: path.display().to_string(),
        reason: err.to_string(),
    })
}
