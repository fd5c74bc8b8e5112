//! Context archive serialization.
//!
//! The assembled tree is serialized into an uncompressed tar stream, which
//! is what both backends consume. Paths use forward slashes relative to the
//! context root; file modes are preserved; timestamps are zeroed so the
//! bytes are deterministic for a given tree.

use crate::context::{BuildContext, DirEntry, Entry};
use crate::error::{KilnError, Result};
use crate::paths;
use std::path::PathBuf;
use tar::{Builder, EntryType, Header};
use uuid::Uuid;

/// Serialize a context into an uncompressed tar archive.
pub fn archive(context: &BuildContext) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    append_dir(&mut builder, &context.root, "")?;
    builder.into_inner().map_err(|e| KilnError::io("<archive>", e))
}

fn append_dir(builder: &mut Builder<Vec<u8>>, dir: &DirEntry, prefix: &str) -> Result<()> {
    for (name, entry) in &dir.children {
        let rel =
            if prefix.is_empty() { name.clone() } else { format!("{}/{}", prefix, name) };
        match entry {
            Entry::Directory(sub) => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Directory);
                header.set_mode(sub.mode);
                header.set_size(0);
                header.set_mtime(0);
                builder
                    .append_data(&mut header, format!("{}/", rel), std::io::empty())
                    .map_err(|e| KilnError::io(&rel, e))?;
                append_dir(builder, sub, &rel)?;
            }
            Entry::File(file) => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Regular);
                header.set_mode(file.mode);
                header.set_size(file.content.len() as u64);
                header.set_mtime(0);
                builder
                    .append_data(&mut header, &rel, file.content.as_slice())
                    .map_err(|e| KilnError::io(&rel, e))?;
            }
        }
    }
    Ok(())
}

/// On-disk record of a build's context archive, removed when dropped.
#[derive(Debug)]
pub struct TempArchive {
    path: PathBuf,
}

impl TempArchive {
    /// Write the archive bytes to `<data_dir>/tmp/build-context-<uuid>.tar`.
    pub fn write(bytes: &[u8]) -> Result<Self> {
        let dir = paths::tmp_dir();
        std::fs::create_dir_all(&dir).map_err(|e| KilnError::io(&dir, e))?;
        let path = dir.join(format!("build-context-{}.tar", Uuid::new_v4()));
        std::fs::write(&path, bytes).map_err(|e| KilnError::io(&path, e))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
