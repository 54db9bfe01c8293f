//! Per-run memoization of file hashes.
//!
//! Several dependency nodes routinely track the same file (tool packages,
//! shared inputs), and hashing — especially content hashing — is the
//! dominant I/O cost of a run. [`FileHashCache`] computes each distinct
//! resolved path at most once per run and hands the cached digest to every
//! later caller.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use sha1::{Digest, Sha1};

/// The fixed all-zero digest standing in for a missing or unreadable file.
///
/// Returning a well-known value instead of an error lets a node "exist" with
/// a deterministic hash before its producer has ever run, which is what makes
/// the first run of any pipeline always register as changed.
pub const SENTINEL_HASH: &str = "0000000000000000000000000000000000000000";

/// Process-wide (per run) cache of `resolved path -> 40-hex SHA-1 digest`.
///
/// The map is internally synchronized, so one cache instance can be shared
/// across concurrently executing pipeline runs and across the thread-tag
/// branches of a single stage. The cache is scoped to one run by
/// construction: a file modified after it was first hashed keeps returning
/// the original digest for the remainder of the run. That staleness pins a
/// node's identity to the state observed when the run started.
#[derive(Debug, Default)]
pub struct FileHashCache {
    hashes: DashMap<String, String>,
}

impl FileHashCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the digest for `path`, computing and caching it on first use.
    ///
    /// With `hash_content` set the digest covers the full file bytes;
    /// otherwise it covers the cheap metadata pair (byte length,
    /// last-modification time). The first call for a given path decides
    /// which mode the cached value carries.
    ///
    /// A path that does not exist, or that disappears between enumeration
    /// and hashing, yields [`SENTINEL_HASH`] — never an error.
    pub fn get_or_compute(&self, path: &str, hash_content: bool) -> String {
        if let Some(hash) = self.hashes.get(path) {
            return hash.clone();
        }
        let hash = if hash_content {
            hash_file_content(Path::new(path))
        } else {
            hash_file_metadata(Path::new(path))
        };
        self.hashes.insert(path.to_string(), hash.clone());
        hash
    }

    /// Recomputes the digest for `path`, overwriting any cached value.
    ///
    /// The one sanctioned breach of the cache's run-scoped staleness: after
    /// a tool has executed, its declared outputs are re-hashed so the
    /// persisted snapshot (and every node derived later in the run) reflects
    /// the produced files instead of their pre-run state. Without this, a
    /// produced file would be remembered as missing and the next run would
    /// re-execute work that is already done.
    pub fn refresh(&self, path: &str, hash_content: bool) -> String {
        let hash = if hash_content {
            hash_file_content(Path::new(path))
        } else {
            hash_file_metadata(Path::new(path))
        };
        self.hashes.insert(path.to_string(), hash.clone());
        hash
    }

    /// Number of distinct paths hashed so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Whether no path has been hashed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// SHA-1 over (byte length, mtime-since-epoch in nanoseconds), both as
/// little-endian bytes. Cheap: one `stat`, no file reads.
fn hash_file_metadata(path: &Path) -> String {
    let Ok(meta) = fs::metadata(path) else {
        return SENTINEL_HASH.to_string();
    };
    let mtime_nanos = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0u128, |d| d.as_nanos());

    let mut hasher = Sha1::new();
    hasher.update(meta.len().to_le_bytes());
    hasher.update(mtime_nanos.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-1 over the full file bytes.
fn hash_file_content(path: &Path) -> String {
    let Ok(content) = fs::read(path) else {
        return SENTINEL_HASH.to_string();
    };
    let mut hasher = Sha1::new();
    hasher.update(&content);
    hex::encode(hasher.finalize())
}
