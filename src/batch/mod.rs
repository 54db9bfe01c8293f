//! Batch execution: artifact discovery, fleet slicing, per-artifact runs.
//!
//! The unit of distribution across machines is deliberately static: the
//! full, sorted artifact list is partitioned into contiguous index ranges by
//! a `(nominator, denominator)` pair. No coordination, no shared state —
//! each fleet member computes the same list and takes its slice. The only
//! sharing caveat is the cache directory, which must be private per worker
//! so two members never write the same snapshot file.
//!
//! Within one batch, artifacts are independent: each gets its own scope,
//! pipeline, and snapshot, and one artifact's failure never aborts its
//! siblings. The first failure's error is reported as the batch result once
//! every artifact has had its turn.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::core::UprezError;
use crate::manifest::{ArtifactSettings, ProcessRegistry, TransformRegistry};
use crate::pipeline::Pipeline;
use crate::tracker::FileHashCache;
use crate::utils::fs::normalize_slashes;
use crate::vars::VarScope;

/// Aggregate counts for a batch run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    /// Artifacts whose pipeline completed (including all-skipped ones).
    pub completed: usize,
    /// Artifacts skipped because their transform could not be determined.
    pub without_transform: usize,
    /// Artifacts whose pipeline failed.
    pub failed: usize,
    /// Tool invocations executed across all artifacts.
    pub executed: usize,
    /// Tool invocations skipped as up to date across all artifacts.
    pub skipped: usize,
}

/// Recursively lists artifacts under `input_path` whose file name matches
/// `pattern`, as sorted slash-normalized relative paths.
pub fn discover_artifacts(input_path: &Path, pattern: &str) -> Result<Vec<String>> {
    let matcher = glob::Pattern::new(pattern)
        .with_context(|| format!("invalid artifact pattern '{pattern}'"))?;

    let mut artifacts = Vec::new();
    for entry in WalkDir::new(input_path).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !matcher.matches(&name) {
            continue;
        }
        let relative = entry.path().strip_prefix(input_path).unwrap_or(entry.path());
        artifacts.push(normalize_slashes(&relative.to_string_lossy()));
    }
    artifacts.sort();
    Ok(artifacts)
}

/// The contiguous index range job `job` of `total_jobs` is responsible for.
///
/// Every job gets `len / total_jobs` artifacts; the last job also takes the
/// remainder. With more jobs than artifacts the early jobs get empty
/// ranges, which is fine — they simply have nothing to do.
#[must_use]
pub fn slice_for_job(len: usize, job: usize, total_jobs: usize) -> std::ops::Range<usize> {
    let per_job = len / total_jobs;
    let start = job * per_job;
    let end = if job == total_jobs - 1 { len } else { (job + 1) * per_job };
    start..end.max(start)
}

/// Runs a slice of artifacts through their configured pipelines.
pub struct Batch<'a> {
    processes: &'a ProcessRegistry,
    transforms: &'a TransformRegistry,
    global: &'a ArtifactSettings,
    root: &'a VarScope,
    cache: Arc<FileHashCache>,
    hash_content: bool,
    dry_run: bool,
}

impl<'a> Batch<'a> {
    /// Creates a batch over the loaded registries and root scope.
    #[must_use]
    pub fn new(
        processes: &'a ProcessRegistry,
        transforms: &'a TransformRegistry,
        global: &'a ArtifactSettings,
        root: &'a VarScope,
        cache: Arc<FileHashCache>,
        hash_content: bool,
        dry_run: bool,
    ) -> Self {
        Self { processes, transforms, global, root, cache, hash_content, dry_run }
    }

    /// Runs every artifact in order.
    ///
    /// Artifacts are isolated: a failure is logged, counted, and remembered,
    /// and the loop moves on. After the last artifact the first failure (if
    /// any) is returned so its exit code becomes the batch result.
    pub async fn run(&self, artifacts: &[String]) -> Result<BatchReport> {
        let input_path = self.root.resolve_path("{input.path}").map_err(UprezError::Var)?;

        let mut report = BatchReport::default();
        let mut first_failure: Option<anyhow::Error> = None;

        for artifact in artifacts {
            // Per-artifact settings override the globals, which in turn fill
            // in around anything the command line pinned down.
            let sidecar = ArtifactSettings::load_optional(
                Path::new(&input_path).join(format!("{artifact}.json")).as_path(),
            );
            let mut local = self.root.clone();
            self.global.merge_into(&mut local, false);
            sidecar.merge_into(&mut local, true);

            let transform_name = match local.try_resolve("{transform}") {
                Ok(name) => name,
                Err(err) => {
                    tracing::warn!("No transform for \"{artifact}\", skipping: {err}");
                    report.without_transform += 1;
                    continue;
                }
            };
            let Some(transform) = self.transforms.get(&transform_name) else {
                tracing::warn!("Transform '{transform_name}' not found, skipping \"{artifact}\"");
                report.without_transform += 1;
                continue;
            };

            tracing::info!("Running pipeline '{transform_name}' on \"{artifact}\"");
            let pipeline = Pipeline::new(
                self.processes,
                transform,
                local,
                Arc::clone(&self.cache),
                self.hash_content,
                self.dry_run,
            );
            match pipeline.run(artifact).await {
                Ok(run) => {
                    report.completed += 1;
                    report.executed += run.executed;
                    report.skipped += run.skipped;
                }
                Err(err) => {
                    tracing::error!("Pipeline failed for \"{artifact}\": {err}");
                    report.failed += 1;
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}
