//! Digest cache.
//!
//! Persists the last successfully built digest per module so unchanged
//! modules skip the backend entirely. Records live under a user-scoped
//! cache root, one file per module, named by the SHA-1 of the module's
//! absolute directory. This is the only state shared between engine runs.

use crate::error::{KilnError, Result};
use crate::paths;
use sha1::{Digest, Sha1};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Content-addressed digest store.
#[derive(Debug, Clone)]
pub struct DigestCache {
    root: PathBuf,
}

impl DigestCache {
    /// Cache rooted at the default location, `<data_dir>/digests`.
    pub fn new() -> Self {
        Self { root: paths::digests_dir() }
    }

    /// Cache rooted at an explicit directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// The record path for a module directory.
    pub fn record_path(&self, module_dir: &Path) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(module_dir.to_string_lossy().as_bytes());
        self.root.join(format!("{:x}", hasher.finalize()))
    }

    /// The previously recorded digest, or `None` when the module has never
    /// been built or the record is unreadable. The cache is advisory; an
    /// unreadable record simply forces a rebuild.
    pub fn cached_digest(&self, module_dir: &Path) -> Option<String> {
        let path = self.record_path(module_dir);
        match std::fs::read_to_string(&path) {
            Ok(body) => Some(body.trim().to_string()),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no cached digest");
                None
            }
        }
    }

    /// Record a digest atomically: write to a temp file in the cache root,
    /// then rename over the record path.
    pub fn record_digest(&self, module_dir: &Path, digest: &str) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| KilnError::io(&self.root, e))?;
        let mut tmp =
            NamedTempFile::new_in(&self.root).map_err(|e| KilnError::io(&self.root, e))?;
        tmp.write_all(digest.as_bytes()).map_err(|e| KilnError::io(tmp.path(), e))?;
        let path = self.record_path(module_dir);
        tmp.persist(&path).map_err(|e| KilnError::io(&path, e.error))?;
        Ok(())
    }
}

impl Default for DigestCache {
    fn default() -> Self {
        Self::new()
    }
}
