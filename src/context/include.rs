//! Recipe reachability scan.
//!
//! Derives the include set used to filter the context digest: a lexical
//! pass over the recipe collects the source argument of every directive
//! that copies files out of the build context, then retains each prefix
//! component so parent directories survive the filter. The scan is
//! deliberately conservative; it may over-approximate the reachable set,
//! which costs an occasional rebuild but never misses an edit.

use crate::context::ignore::IgnoreMatcher;
use crate::error::{KilnError, Result};
use crate::paths;
use std::path::Path;

/// Build the include matcher for a recipe.
///
/// `relative_recipe` is the recipe's context-relative path; it is always
/// part of the include set so recipe edits invalidate the digest.
pub fn include_matcher(
    context_dir: &Path,
    recipe_path: &Path,
    relative_recipe: &str,
) -> Result<IgnoreMatcher> {
    let content =
        std::fs::read_to_string(recipe_path).map_err(|e| KilnError::io(recipe_path, e))?;
    let mut included: Vec<String> = Vec::new();
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let instruction = match fields.next() {
            Some(instruction) => instruction,
            None => continue,
        };
        if !instruction.eq_ignore_ascii_case("COPY") && !instruction.eq_ignore_ascii_case("ADD") {
            continue;
        }
        let args: Vec<&str> = fields.collect();
        if args.iter().any(|arg| arg.starts_with("--from")) {
            // Sources live in another build stage, not in the context.
            continue;
        }
        let source = match args.iter().find(|arg| !arg.starts_with("--")) {
            Some(source) => *source,
            None => continue,
        };
        let mut rel = source.to_string();
        let abs = paths::clean(&context_dir.join(&rel));
        let info = std::fs::metadata(&abs)
            .map_err(|_| KilnError::MissingContextPath { path: abs.clone() })?;
        if info.is_dir() && !rel.ends_with('/') {
            rel.push('/');
        }
        add_with_prefixes(&mut included, &rel);
    }
    add_with_prefixes(&mut included, relative_recipe);
    Ok(IgnoreMatcher::parse(&included.join("\n")))
}

/// Add `rel` and every prefix path component to the set, preserving the
/// trailing slash of directory entries.
fn add_with_prefixes(included: &mut Vec<String>, rel: &str) {
    let is_dir = rel.ends_with('/');
    let parts: Vec<&str> = rel
        .trim_end_matches('/')
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    if parts.is_empty() {
        push_unique(included, ".".to_string());
        return;
    }
    for end in 1..=parts.len() {
        let mut entry = parts[..end].join("/");
        if end == parts.len() && is_dir {
            entry.push('/');
        }
        push_unique(included, entry);
    }
}

fn push_unique(included: &mut Vec<String>, entry: String) {
    if !included.contains(&entry) {
        included.push(entry);
    }
}
