//! Dependency-node snapshots: build, persist, compare.
//!
//! Change detection in uprez is organized around named dependency groups
//! ("nodes"): each node owns a set of tracked file paths and an aggregate
//! hash that is a pure function of the sorted `(path, hash)` pairs plus any
//! extra identity items folded in (the resolved command line, for one).
//!
//! A run builds a fresh set of nodes with [`SnapshotBuilder`], loads the
//! previous run's persisted set with [`Snapshot::load`], and asks
//! [`Snapshot::is_identical`] per node to decide whether the corresponding
//! work can be skipped. At the end of the run the *new* snapshot is written
//! back — unconditionally — so the stored state always reflects the most
//! recent observation.
//!
//! Absence is always conservative: a node missing from either side compares
//! as "not identical" and forces execution, and a snapshot file that cannot
//! be read is treated as empty rather than as an error.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::utils::fs::atomic_write;

pub mod cache;

pub use cache::{FileHashCache, SENTINEL_HASH};


/// One named dependency group: tracked files with their last-known hashes,
/// plus the aggregate hash over the whole group.
///
/// The serialized form is the on-disk snapshot record. `files` is a sorted
/// map, so serialization is deterministic and an unchanged group round-trips
/// byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileGroup {
    /// Node name, e.g. `default.uprez.esr` or `process.esrgan`.
    pub name: String,
    /// Aggregate hash of the sorted `(path, hash)` pairs and identity items.
    pub hash: String,
    /// Tracked file path -> hash at the time the group was built.
    pub files: BTreeMap<String, String>,
}

/// Builds the current run's set of dependency nodes.
///
/// Registration is idempotent-add: the first registration of a name wins and
/// later calls for the same name return the already-computed hash without
/// touching the group. Callers must therefore ensure the first registration
/// is the authoritative one.
///
/// The group map sits behind a mutex so thread-tag branches of a stage can
/// register nodes concurrently; file hashing goes through the shared
/// [`FileHashCache`].
pub struct SnapshotBuilder {
    groups: Mutex<BTreeMap<String, FileGroup>>,
    cache: Arc<FileHashCache>,
    hash_content: bool,
}

impl SnapshotBuilder {
    /// Creates a builder that hashes through `cache`.
    ///
    /// `hash_content` selects content hashing for tracked files instead of
    /// the default metadata hashing.
    #[must_use]
    pub fn new(cache: Arc<FileHashCache>, hash_content: bool) -> Self {
        Self { groups: Mutex::new(BTreeMap::new()), cache, hash_content }
    }

    /// Registers the node `name` over `files` and returns its aggregate hash.
    ///
    /// `files` must already be resolved paths; duplicates are collapsed by
    /// the sorted map. `items` are extra `(key, value)` identity pairs folded
    /// into the aggregate hash after the file pairs, in key-sorted order —
    /// this is how a process's resolved command line becomes part of its
    /// node identity without being a file.
    ///
    /// If the node is already registered, its existing hash is returned and
    /// nothing is recomputed.
    pub fn add_group(&self, name: &str, files: &[String], items: &[(String, String)]) -> String {
        let mut groups = self.groups.lock().expect("snapshot builder lock poisoned");
        if let Some(existing) = groups.get(name) {
            return existing.hash.clone();
        }

        let mut file_hashes = BTreeMap::new();
        for file in files {
            let hash = self.cache.get_or_compute(file, self.hash_content);
            file_hashes.insert(file.clone(), hash);
        }

        let mut sorted_items: Vec<&(String, String)> = items.iter().collect();
        sorted_items.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha1::new();
        for (path, hash) in &file_hashes {
            hasher.update(path.as_bytes());
            hasher.update(hash.as_bytes());
        }
        for (key, value) in sorted_items {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }
        let aggregate = hex::encode(hasher.finalize());

        groups.insert(
            name.to_string(),
            FileGroup { name: name.to_string(), hash: aggregate.clone(), files: file_hashes },
        );
        aggregate
    }

    /// Returns the aggregate hash of a registered node, if any.
    #[must_use]
    pub fn group_hash(&self, name: &str) -> Option<String> {
        let groups = self.groups.lock().expect("snapshot builder lock poisoned");
        groups.get(name).map(|g| g.hash.clone())
    }

    /// Unregisters a node.
    ///
    /// Used when a process fails after registration: dropping its node from
    /// the snapshot that gets persisted guarantees the next run sees it as
    /// changed and re-executes it.
    pub fn remove_group(&self, name: &str) {
        let mut groups = self.groups.lock().expect("snapshot builder lock poisoned");
        groups.remove(name);
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.lock().expect("snapshot builder lock poisoned").len()
    }

    /// Whether no node has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes all registered nodes to `path` as pretty JSON, overwriting
    /// any existing file.
    ///
    /// Groups are written in name-sorted order with sorted file maps, so the
    /// output is byte-for-byte reproducible for unchanged input. The write
    /// is atomic (temp file + rename); an unwritable target is a hard error.
    pub fn save(&self, path: &Path) -> Result<()> {
        let groups = self.groups.lock().expect("snapshot builder lock poisoned");
        let nodes: Vec<&FileGroup> = groups.values().collect();
        let json = serde_json::to_string_pretty(&nodes)?;
        atomic_write(path, json.as_bytes())
            .with_context(|| format!("Cannot write snapshot file: {}", path.display()))
    }
}

/// A previously persisted snapshot, loaded for comparison.
#[derive(Debug, Default)]
pub struct Snapshot {
    groups: BTreeMap<String, FileGroup>,
}

impl Snapshot {
    /// Loads a snapshot from `path`.
    ///
    /// A missing, unreadable, or unparsable file yields an empty snapshot —
    /// every node then compares as changed, which is the conservative
    /// default for a first run or a corrupted cache. Parse problems are
    /// logged, not raised.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let mut snapshot = Self::default();
        if !path.exists() {
            return snapshot;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Cannot read snapshot '{}': {err}", path.display());
                return snapshot;
            }
        };
        match serde_json::from_str::<Vec<FileGroup>>(&content) {
            Ok(nodes) => {
                for node in nodes {
                    snapshot.groups.insert(node.name.clone(), node);
                }
            }
            Err(err) => {
                tracing::warn!("Cannot parse snapshot '{}': {err}", path.display());
            }
        }
        snapshot
    }

    /// Whether node `name` has the same aggregate hash in this snapshot and
    /// in `builder`.
    ///
    /// Absence on either side is "not identical": a node with no history, or
    /// one the current configuration no longer produces, must execute.
    #[must_use]
    pub fn is_identical(&self, name: &str, builder: &SnapshotBuilder) -> bool {
        let Some(stored) = self.groups.get(name) else {
            return false;
        };
        match builder.group_hash(name) {
            Some(fresh) => stored.hash == fresh,
            None => false,
        }
    }

    /// Whether this snapshot and `builder` contain exactly the same node set
    /// with identical hashes.
    ///
    /// Used for the shared process-registry snapshot, where one difference
    /// anywhere means the registry state on disk must be refreshed.
    #[must_use]
    pub fn matches(&self, builder: &SnapshotBuilder) -> bool {
        if self.groups.len() != builder.len() {
            return false;
        }
        self.groups.iter().all(|(name, group)| builder.group_hash(name) == Some(group.hash.clone()))
    }

    /// Look up a stored group by name.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&FileGroup> {
        self.groups.get(name)
    }

    /// Number of stored nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether the snapshot holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
