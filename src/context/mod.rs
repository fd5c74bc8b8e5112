//! Build-context assembly.
//!
//! Walks a module's context directory into an in-memory tree, applying the
//! `.dockerignore` exclude rules, injects the recipe file, and derives the
//! include matcher that restricts the digest to what the recipe actually
//! reads. Children are kept in sorted order so digesting and archiving the
//! same tree is deterministic by construction.

pub mod archive;
pub mod digest;
pub mod ignore;
pub mod include;

pub use archive::{archive, TempArchive};
pub use digest::digest;
pub use ignore::IgnoreMatcher;

use crate::error::{KilnError, Result};
use crate::manifest::BuildSpec;
use std::collections::BTreeMap;
use std::path::{Component, Path};
use tracing::warn;

/// One entry in the context tree.
#[derive(Debug, Clone)]
pub enum Entry {
    File(FileEntry),
    Directory(DirEntry),
}

/// A regular file: content plus the mode bits preserved into the archive.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub mode: u32,
    pub content: Vec<u8>,
}

/// A directory and its children, keyed by name in sorted order.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub mode: u32,
    pub children: BTreeMap<String, Entry>,
}

/// The full in-memory build context rooted at the context directory.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub root: DirEntry,
}

/// Result of assembling a module's context.
#[derive(Debug)]
pub struct AssembledContext {
    pub context: BuildContext,
    /// Recipe path relative to the context root, forward slashes.
    pub relative_recipe: String,
    /// Reachability filter applied when digesting.
    pub include: IgnoreMatcher,
}

/// Assemble the build context for a module.
pub fn assemble(module_dir: &Path, spec: &BuildSpec) -> Result<AssembledContext> {
    let context_dir = spec.context_path(module_dir);
    let context_meta = std::fs::metadata(&context_dir)
        .map_err(|_| KilnError::ContextNotFound { path: context_dir.clone() })?;
    if !context_meta.is_dir() {
        return Err(KilnError::ContextNotFound { path: context_dir });
    }

    let ignore_path = context_dir.join(".dockerignore");
    let exclude = if ignore_path.is_file() {
        let body =
            std::fs::read_to_string(&ignore_path).map_err(|e| KilnError::io(&ignore_path, e))?;
        IgnoreMatcher::parse(&body)
    } else {
        IgnoreMatcher::empty()
    };

    let recipe_path = spec.recipe_path(module_dir);
    let relative_recipe = relative_to_context(&context_dir, &recipe_path);
    let include = include::include_matcher(&context_dir, &recipe_path, &relative_recipe)?;

    let mut root = DirEntry { mode: mode_of(&context_meta), children: BTreeMap::new() };
    walk_into(&context_dir, &context_dir, &exclude, &mut root.children)?;
    if root.children.contains_key(".git") {
        warn!(
            context = %context_dir.display(),
            ".git was included in the build context, which may not be intentional"
        );
    }
    insert_file(&context_dir, &relative_recipe, &mut root.children)?;

    Ok(AssembledContext { context: BuildContext { root }, relative_recipe, include })
}

/// Compute a path relative to the context root by stripping the longest
/// common prefix. A recipe outside the context still yields a root-relative
/// injection path rather than one with `..` components.
pub fn relative_to_context(context_dir: &Path, path: &Path) -> String {
    let context: Vec<Component> = context_dir.components().collect();
    let target: Vec<Component> = path.components().collect();
    let common = context.iter().zip(target.iter()).take_while(|(a, b)| a == b).count();
    target[common..]
        .iter()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn walk_into(
    dir: &Path,
    context_dir: &Path,
    exclude: &IgnoreMatcher,
    out: &mut BTreeMap<String, Entry>,
) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| KilnError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| KilnError::io(dir, e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = std::fs::metadata(&path).map_err(|e| KilnError::io(&path, e))?;
        let rel = relative_to_context(context_dir, &path);
        let is_dir = meta.is_dir();
        if exclude.matches(&rel, is_dir) {
            continue;
        }
        if is_dir {
            let mut children = BTreeMap::new();
            walk_into(&path, context_dir, exclude, &mut children)?;
            out.insert(name, Entry::Directory(DirEntry { mode: mode_of(&meta), children }));
        } else {
            let content = std::fs::read(&path).map_err(|e| KilnError::io(&path, e))?;
            out.insert(name, Entry::File(FileEntry { mode: mode_of(&meta), content }));
        }
    }
    Ok(())
}

/// Insert a single file into the tree by its context-relative path,
/// creating intermediate directory entries from disk metadata. A file that
/// is already present (because the walk picked it up) is left untouched.
fn insert_file(
    context_dir: &Path,
    relative: &str,
    out: &mut BTreeMap<String, Entry>,
) -> Result<()> {
    let parts: Vec<&str> =
        relative.split('/').filter(|part| !part.is_empty() && *part != ".").collect();
    insert_at(context_dir, &parts, out)
}

fn insert_at(disk_dir: &Path, parts: &[&str], out: &mut BTreeMap<String, Entry>) -> Result<()> {
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return Ok(()),
    };
    let disk = disk_dir.join(first);
    if rest.is_empty() {
        if out.contains_key(*first) {
            // The walk already captured it.
            return Ok(());
        }
        let meta = std::fs::metadata(&disk).map_err(|e| KilnError::io(&disk, e))?;
        let content = std::fs::read(&disk).map_err(|e| KilnError::io(&disk, e))?;
        out.insert(first.to_string(), Entry::File(FileEntry { mode: mode_of(&meta), content }));
        return Ok(());
    }
    if !out.contains_key(*first) {
        let meta = std::fs::metadata(&disk).map_err(|e| KilnError::io(&disk, e))?;
        out.insert(
            first.to_string(),
            Entry::Directory(DirEntry { mode: mode_of(&meta), children: BTreeMap::new() }),
        );
    }
    match out.get_mut(*first) {
        Some(Entry::Directory(dir)) => insert_at(&disk, rest, &mut dir.children),
        Some(Entry::File(_)) => Err(KilnError::io(
            &disk,
            std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
        )),
        None => unreachable!("entry inserted above"),
    }
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

impl BuildContext {
    /// Look up an entry by context-relative path. Test and tooling helper.
    pub fn get(&self, rel: &str) -> Option<&Entry> {
        let mut current = &self.root.children;
        let parts: Vec<&str> = rel.split('/').filter(|part| !part.is_empty()).collect();
        let (last, ancestors) = parts.split_last()?;
        for part in ancestors {
            match current.get(*part)? {
                Entry::Directory(dir) => current = &dir.children,
                Entry::File(_) => return None,
            }
        }
        current.get(*last)
    }
}
