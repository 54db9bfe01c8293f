//! uprez — incremental multi-stage pipeline runner for image transforms.
//!
//! Given a tree of input artifacts (images), uprez resolves per-artifact
//! configuration, expands it into a named sequence of external-tool
//! invocations (processes inside stages inside a transform), and executes
//! only the invocations whose effective inputs changed since the last run.
//! It is a miniature incremental build system around three subsystems:
//!
//! - [`vars`] — the variable-scope/templating engine: nested brace
//!   references (`{a.{b}.c}`), deterministic merge policies, environment
//!   expansion;
//! - [`tracker`] — content/metadata-hash dependency tracking: per-run file
//!   hash caching, named dependency nodes with aggregate hashes, persisted
//!   snapshots compared across runs;
//! - [`pipeline`] — the execution model: variable scopes threaded through
//!   stages and processes, node identities derived by convention,
//!   per-process skip/execute decisions, deterministic failure propagation.
//!
//! # Configuration model
//!
//! Two JSON registries drive a run. The *process registry* names every
//! external tool: its executable, package files, and default variables.
//! The *transform registry* names pipelines: ordered stages of
//! process-invocations, each with variables and a command-line template.
//! Artifacts pick their transform through the `{transform}` variable,
//! seeded from `global.config.json` and overridable per artifact by a
//! `<artifact>.json` sidecar.
//!
//! # Incrementality
//!
//! Every (transform, stage, invocation) triple owns a dependency node. Its
//! tracked files — the process's package state plus the declared
//! `.input`/`.output` paths — and its resolved command line are hashed into
//! a single aggregate; if that aggregate matches the artifact's previous
//! snapshot, the tool is not run. Snapshots are rewritten after every run,
//! so a failed artifact resumes where it left off.
//!
//! # Fleet splitting
//!
//! The sorted artifact list can be statically partitioned across machines
//! with `--nominator`/`--denominator`; members share nothing but must use
//! private cache directories ([`batch`]).

pub mod batch;
pub mod cli;
pub mod core;
pub mod manifest;
pub mod pipeline;
pub mod tracker;
pub mod utils;
pub mod vars;
