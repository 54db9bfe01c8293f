//! Pipeline orchestration: stages, processes, skip decisions, execution.
//!
//! One [`Pipeline`] run covers one input artifact and is a self-contained
//! synchronous sequence of decisions:
//!
//! 1. **Seed** the artifact scope with the well-known `transform.*` bindings
//!    and load the artifact's prior snapshot.
//! 2. **Expand** the configured stages: stage 0 reads the root scope, every
//!    later stage reads its predecessor's output scope, and each invocation
//!    gets a private scope (its own vars, then the registry defaults, then
//!    the stage input — first binding wins). Sibling invocations never see
//!    each other inside the same stage; only the next stage sees the union.
//! 3. Per invocation, **derive** its dependency node: the name is
//!    `<transform>.<stage>.<invocation>`, the tracked files are the
//!    process's node file plus every declared `.input`/`.output` value
//!    resolved through the private scope, and the resolved command line is
//!    folded into the node identity.
//! 4. **Compare** against the prior snapshot and either skip or spawn the
//!    tool. A non-zero exit aborts the remaining pipeline for this artifact.
//! 5. **Persist** the fresh snapshot, even on partial failure, so completed
//!    work stays completed across attempts. The failed node itself is
//!    dropped first and therefore re-runs next time.
//!
//! Invocations within a stage may be fanned out by their thread-affinity
//! tag: different tags run concurrently, the same tag stays sequential, and
//! all tags join before the stage's output scope is computed.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::core::UprezError;
use crate::manifest::{InvocationSpec, ProcessRegistry, ProcessSpec, StageSpec, TransformSpec};
use crate::tracker::{FileHashCache, Snapshot, SnapshotBuilder};
use crate::vars::VarScope;

pub mod command;

pub use command::ToolCommand;

#[cfg(test)]
mod tests;

/// What a pipeline run did, when it did not fail.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    /// Invocations whose tool was executed (or would be, under dry-run).
    pub executed: usize,
    /// Invocations skipped because their node was identical.
    pub skipped: usize,
}

/// The well-known bindings derived from an artifact's relative path.
///
/// `transform.input` / `transform.output` anchor the artifact under the
/// input and output trees, and the filename / extension / subpath pieces are
/// bound separately so configuration can address them individually (model
/// lookup by filename is the canonical use).
#[must_use]
pub fn seed_bindings(artifact: &str) -> Vec<(String, String)> {
    let path = Path::new(artifact);
    let filename = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();
    let subpath = path
        .parent()
        .map(|p| crate::utils::fs::normalize_slashes(&p.to_string_lossy()))
        .unwrap_or_default();

    let mut bindings = vec![
        ("transform.input".to_string(), format!("{{input.path}}/{artifact}")),
        ("transform.output".to_string(), format!("{{output.path}}/{artifact}")),
    ];
    for side in ["input", "output"] {
        bindings.push((format!("transform.{side}.filename"), filename.clone()));
        bindings.push((format!("transform.{side}.filename.ext"), ext.clone()));
        bindings.push((format!("transform.{side}.subpath"), subpath.clone()));
    }
    bindings
}

/// One expanded process-invocation: its configuration plus the private
/// scope all of its resolution goes through.
#[derive(Debug)]
struct ProcessInvocation<'a> {
    spec: &'a InvocationSpec,
    registry: &'a ProcessSpec,
    vars: VarScope,
}

/// One expanded stage.
#[derive(Debug)]
struct Stage<'a> {
    spec: &'a StageSpec,
    processes: Vec<ProcessInvocation<'a>>,
    output_vars: VarScope,
}

/// A configured pipeline, ready to run against individual artifacts.
pub struct Pipeline<'a> {
    processes: &'a ProcessRegistry,
    transform: &'a TransformSpec,
    vars: VarScope,
    cache: Arc<FileHashCache>,
    hash_content: bool,
    dry_run: bool,
}

impl<'a> Pipeline<'a> {
    /// Creates a pipeline over `transform` with the artifact's local scope.
    #[must_use]
    pub fn new(
        processes: &'a ProcessRegistry,
        transform: &'a TransformSpec,
        vars: VarScope,
        cache: Arc<FileHashCache>,
        hash_content: bool,
        dry_run: bool,
    ) -> Self {
        Self { processes, transform, vars, cache, hash_content, dry_run }
    }

    /// Runs the pipeline for one artifact (a slash-normalized path relative
    /// to `{input.path}`).
    ///
    /// # Errors
    ///
    /// Configuration errors (unknown process, unresolved variable) and tool
    /// failures ([`UprezError::ProcessFailed`]). Whenever execution was
    /// reached, the fresh snapshot has been persisted before this returns.
    pub async fn run(&self, artifact: &str) -> Result<PipelineReport> {
        let mut root = self.vars.clone();
        for (key, value) in seed_bindings(artifact) {
            root.add(&key, &value, false);
        }

        let snapshot_path = root
            .resolve_path(&format!("{{cache.path}}/{artifact}.dep.json"))
            .map_err(UprezError::Var)?;
        let stored = Snapshot::load(Path::new(&snapshot_path));
        let builder = SnapshotBuilder::new(Arc::clone(&self.cache), self.hash_content);

        let stages = self.expand(&root)?;

        let mut report = PipelineReport::default();
        let mut failure: Option<anyhow::Error> = None;
        for stage in &stages {
            match self.run_stage(stage, &builder, &stored).await {
                Ok(stage_report) => {
                    report.executed += stage_report.executed;
                    report.skipped += stage_report.skipped;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        // The snapshot reflects everything registered so far; a dry-run must
        // not publish it or the next real run would skip unrun work.
        if !self.dry_run {
            builder.save(Path::new(&snapshot_path))?;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Expands the transform's stages into scoped invocations.
    ///
    /// Pure configuration work: no filesystem access, no hashing. Kept
    /// separate from execution so `validate` semantics and tests can reason
    /// about scope threading in isolation.
    fn expand(&self, root: &VarScope) -> Result<Vec<Stage<'a>>, UprezError> {
        let mut stages: Vec<Stage<'a>> = Vec::new();
        for (index, spec) in self.transform.stages.iter().enumerate() {
            let input_vars =
                if index == 0 { root.clone() } else { stages[index - 1].output_vars.clone() };

            let mut processes = Vec::new();
            for invocation in &spec.processes {
                let registry = self.processes.get(&invocation.process).ok_or_else(|| {
                    UprezError::UnknownProcess {
                        transform: self.transform.name.clone(),
                        stage: spec.name.clone(),
                        invocation: invocation.name.clone(),
                        process: invocation.process.clone(),
                    }
                })?;

                let mut vars = VarScope::new();
                for (key, value) in &invocation.vars {
                    vars.add(key, value, false);
                }
                for (key, value) in &registry.vars {
                    vars.add(key, value, false);
                }
                vars.merge(&input_vars, false);

                processes.push(ProcessInvocation { spec: invocation, registry, vars });
            }

            let mut output_vars = VarScope::new();
            for process in &processes {
                output_vars.merge(&process.vars, false);
            }

            stages.push(Stage { spec, processes, output_vars });
        }
        Ok(stages)
    }

    /// Runs one stage: invocations grouped by thread tag, groups joined
    /// before returning.
    async fn run_stage(
        &self,
        stage: &Stage<'a>,
        builder: &SnapshotBuilder,
        stored: &Snapshot,
    ) -> Result<PipelineReport> {
        let groups = group_by_thread(&stage.processes);

        let tag_runs = groups.into_iter().map(|(_tag, group)| async move {
            let mut report = PipelineReport::default();
            for process in group {
                if self.run_process(stage, process, builder, stored).await? {
                    report.executed += 1;
                } else {
                    report.skipped += 1;
                }
            }
            Ok::<_, anyhow::Error>(report)
        });

        let mut report = PipelineReport::default();
        let mut failure = None;
        for result in futures::future::join_all(tag_runs).await {
            match result {
                Ok(group_report) => {
                    report.executed += group_report.executed;
                    report.skipped += group_report.skipped;
                }
                Err(err) if failure.is_none() => failure = Some(err),
                Err(_) => {}
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Decides skip/execute for one invocation and runs the tool if needed.
    ///
    /// Returns whether the tool executed (or would execute, under dry-run).
    async fn run_process(
        &self,
        stage: &Stage<'a>,
        process: &ProcessInvocation<'a>,
        builder: &SnapshotBuilder,
        stored: &Snapshot,
    ) -> Result<bool> {
        let node_name =
            format!("{}.{}.{}", self.transform.name, stage.spec.name, process.spec.name);

        let cmdline = process.vars.try_resolve(&process.spec.cmdline).map_err(UprezError::Var)?;
        let (files, outputs) = tracked_files(process).map_err(UprezError::Var)?;
        let items = vec![
            ("process".to_string(), process.spec.process.clone()),
            ("cmdline".to_string(), cmdline.clone()),
        ];
        builder.add_group(&node_name, &files, &items);

        if stored.is_identical(&node_name, builder) {
            tracing::info!("Skipping '{node_name}' (up to date)");
            return Ok(false);
        }

        let executable = process
            .vars
            .resolve_path(&format!("{{tools.path}}/{}", process.registry.executable))
            .map_err(UprezError::Var)?;

        if self.dry_run {
            tracing::info!("[dry-run] Would run '{node_name}': {executable} {cmdline}");
            return Ok(true);
        }

        tracing::info!("Running '{node_name}'");
        let code = ToolCommand::new(&executable)
            .args_from_cmdline(&cmdline)
            .with_context(node_name.clone())
            .status()
            .await?;

        if code != 0 {
            // Keep the failed node out of the snapshot so the next attempt
            // re-executes it; the completed prefix stays recorded.
            builder.remove_group(&node_name);
            return Err(UprezError::ProcessFailed {
                process: process.spec.name.clone(),
                stage: stage.spec.name.clone(),
                code,
            }
            .into());
        }

        // The tool ran: its outputs exist now. Re-hash them and re-register
        // the node so the persisted snapshot and downstream nodes see the
        // produced files, not the pre-run sentinels. Inputs and the process
        // node file keep their run-scoped cached hashes.
        builder.remove_group(&node_name);
        for output in &outputs {
            self.cache.refresh(output, self.hash_content);
        }
        builder.add_group(&node_name, &files, &items);

        Ok(true)
    }
}

/// The file sets a node cares about, both resolved through the invocation's
/// private scope and deduplicated by resolved path:
///
/// - every tracked file — the process's persisted node file plus every
///   declared `.input`/`.output` value;
/// - the declared outputs alone, which get re-hashed after the tool runs.
#[allow(clippy::type_complexity)]
fn tracked_files(
    process: &ProcessInvocation<'_>,
) -> Result<(Vec<String>, Vec<String>), crate::vars::VarError> {
    let mut files = BTreeSet::new();
    files.insert(process.vars.resolve_path(&process.registry.node_file_template())?);

    let mut declared = VarScope::new();
    for (key, value) in &process.spec.vars {
        declared.add(key, value, false);
    }

    let mut outputs = BTreeSet::new();
    for value in declared.inputs() {
        files.insert(process.vars.resolve_path(&value)?);
    }
    for value in declared.outputs() {
        let resolved = process.vars.resolve_path(&value)?;
        files.insert(resolved.clone());
        outputs.insert(resolved);
    }

    Ok((files.into_iter().collect(), outputs.into_iter().collect()))
}

/// Partitions a stage's invocations by thread tag, preserving declared
/// order both across groups (first appearance) and within each group.
fn group_by_thread<'s, 'a>(
    processes: &'s [ProcessInvocation<'a>],
) -> Vec<(&'s str, Vec<&'s ProcessInvocation<'a>>)> {
    let mut groups: Vec<(&str, Vec<&ProcessInvocation<'a>>)> = Vec::new();
    for process in processes {
        let tag = process.spec.thread.as_str();
        match groups.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, group)) => group.push(process),
            None => groups.push((tag, vec![process])),
        }
    }
    groups
}
