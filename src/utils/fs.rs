//! Filesystem helpers.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Creates a directory and all parents, tolerating an existing directory.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Writes `content` to `path` atomically: temp file in the same directory,
/// then rename. The target is never observed in a partially written state,
/// even if the process dies mid-write. Parent directories are created as
/// needed.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        file.write_all(content)
            .with_context(|| format!("Failed to write to temp file: {}", temp_path.display()))?;
        file.sync_all().with_context(|| "Failed to sync file to disk")?;
    }

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;

    Ok(())
}

/// Normalizes a relative path to forward slashes.
///
/// Stored snapshot keys and artifact identifiers must not depend on the
/// platform separator, or a cache shared between machines would see every
/// node as changed.
#[must_use]
pub fn normalize_slashes(path: &str) -> String {
    path.replace('\\', "/")
}
