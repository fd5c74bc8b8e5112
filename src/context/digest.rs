//! Deterministic context digests.
//!
//! The digest is computed over a canonical stream of the context tree:
//! children in sorted name order, each contributing its name, a type tag,
//! its mode bits, and either a length-prefixed content hash (files) or the
//! recursively computed digest (directories). Entries outside the include
//! set are skipped, so edits the recipe cannot observe do not change the
//! digest.

use crate::context::ignore::IgnoreMatcher;
use crate::context::{BuildContext, DirEntry, Entry};
use sha2::{Digest, Sha256};

/// Compute the hex digest of a context, restricted to the include set.
pub fn digest(context: &BuildContext, include: &IgnoreMatcher) -> String {
    let mut hasher = Sha256::new();
    digest_dir(&context.root, "", include, &mut hasher);
    format!("{:x}", hasher.finalize())
}

fn digest_dir(dir: &DirEntry, prefix: &str, include: &IgnoreMatcher, hasher: &mut Sha256) {
    for (name, entry) in &dir.children {
        let rel =
            if prefix.is_empty() { name.clone() } else { format!("{}/{}", prefix, name) };
        match entry {
            Entry::File(file) => {
                if !include.matches(&rel, false) {
                    continue;
                }
                hasher.update(name.as_bytes());
                hasher.update([0u8]);
                hasher.update(b"f");
                hasher.update(file.mode.to_be_bytes());
                let mut content_hasher = Sha256::new();
                content_hasher.update((file.content.len() as u64).to_be_bytes());
                content_hasher.update(&file.content);
                hasher.update(content_hasher.finalize());
            }
            Entry::Directory(sub) => {
                if !include.matches(&rel, true) {
                    continue;
                }
                hasher.update(name.as_bytes());
                hasher.update([0u8]);
                hasher.update(b"d");
                hasher.update(sub.mode.to_be_bytes());
                let mut sub_hasher = Sha256::new();
                digest_dir(sub, &rel, include, &mut sub_hasher);
                hasher.update(sub_hasher.finalize());
            }
        }
    }
}
