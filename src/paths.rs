//! Centralized path configuration for kiln.
//!
//! All on-disk state goes through this module so the digest cache and the
//! temp archive layout stay consistent across embedders.

use std::path::{Component, Path, PathBuf};

/// Get the kiln data directory.
///
/// Resolution order:
/// 1. `KILN_DATA_DIR` environment variable
/// 2. `~/.kiln`
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KILN_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir().map(|h| h.join(".kiln")).unwrap_or_else(|| PathBuf::from(".kiln"))
}

/// Get the digest cache directory.
pub fn digests_dir() -> PathBuf {
    data_dir().join("digests")
}

/// Get the directory for per-build temp archives.
pub fn tmp_dir() -> PathBuf {
    data_dir().join("tmp")
}

/// Lexically normalize a path: drop `.` components and resolve `..` against
/// preceding components without touching the filesystem.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
