//! Gitignore-grammar path matcher.
//!
//! Used twice per module: once for the `.dockerignore` exclude rules and
//! once for the include set derived from the recipe. An instance answers
//! "is this relative path in the set", where a matched directory pulls in
//! everything beneath it.
//!
//! Supported grammar: blank lines and `#` comments, `!` negation, trailing
//! `/` for directory-only patterns, `**` spanning any number of components,
//! `*`/`?`/`[...]` wildcards within a component, and anchoring (a pattern
//! containing `/` matches from the root, otherwise at any depth). A parent
//! directory match cannot be undone by a child negation, mirroring the
//! usual ignore-file semantics.

use glob::{MatchOptions, Pattern};

const SEGMENT_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
enum Segment {
    /// `**`: matches zero or more path components.
    AnyDepth,
    /// A single component pattern.
    Glob(Pattern),
}

#[derive(Debug, Clone)]
struct Rule {
    negated: bool,
    dir_only: bool,
    anchored: bool,
    /// Empty means the rule matches every path (`.` patterns).
    segments: Vec<Segment>,
}

/// A compiled set of gitignore-style rules.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    rules: Vec<Rule>,
}

impl IgnoreMatcher {
    /// A matcher with no rules; matches nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse rules from file content, one pattern per line.
    pub fn parse(content: &str) -> Self {
        let mut rules = Vec::new();
        for raw in content.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rule) = Rule::parse(line) {
                rules.push(rule);
            }
        }
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `rel` (a forward-slash path relative to the context root) is
    /// in the set. A path is in the set when a rule matches it or any of
    /// its ancestor directories.
    pub fn matches(&self, rel: &str, is_dir: bool) -> bool {
        let parts: Vec<&str> =
            rel.split('/').filter(|part| !part.is_empty() && *part != ".").collect();
        if parts.is_empty() {
            return self.rules.iter().any(|r| r.segments.is_empty() && !r.negated);
        }
        for end in 1..=parts.len() {
            let ancestor = end < parts.len();
            let sub_is_dir = if ancestor { true } else { is_dir };
            if let Some(matched) = self.decide(&parts[..end], sub_is_dir) {
                if ancestor {
                    if matched {
                        return true;
                    }
                    // An explicitly negated ancestor still lets deeper rules
                    // speak for the path itself.
                } else {
                    return matched;
                }
            }
        }
        false
    }

    /// Last matching rule wins, as in ignore files.
    fn decide(&self, parts: &[&str], is_dir: bool) -> Option<bool> {
        let mut result = None;
        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            if rule.matches(parts) {
                result = Some(!rule.negated);
            }
        }
        result
    }
}

impl Rule {
    fn parse(line: &str) -> Option<Self> {
        let (negated, rest) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (dir_only, rest) = match rest.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let (anchored_prefix, rest) = match rest.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let rest = rest.trim();
        if rest.is_empty() || rest == "." {
            // The whole context root.
            return Some(Rule { negated, dir_only: false, anchored: true, segments: Vec::new() });
        }
        let anchored = anchored_prefix || rest.contains('/');
        let segments = rest
            .split('/')
            .filter(|seg| !seg.is_empty() && *seg != ".")
            .map(|seg| {
                if seg == "**" {
                    Segment::AnyDepth
                } else {
                    let pattern = Pattern::new(seg)
                        .unwrap_or_else(|_| Pattern::new(&Pattern::escape(seg)).expect("escaped"));
                    Segment::Glob(pattern)
                }
            })
            .collect::<Vec<_>>();
        if segments.is_empty() {
            return Some(Rule { negated, dir_only: false, anchored: true, segments: Vec::new() });
        }
        Some(Rule { negated, dir_only, anchored, segments })
    }

    fn matches(&self, parts: &[&str]) -> bool {
        if self.segments.is_empty() {
            return true;
        }
        if self.anchored {
            return match_segments(&self.segments, parts);
        }
        (0..parts.len()).any(|start| match_segments(&self.segments, &parts[start..]))
    }
}

fn match_segments(segments: &[Segment], parts: &[&str]) -> bool {
    match segments.first() {
        None => parts.is_empty(),
        Some(Segment::AnyDepth) => {
            (0..=parts.len()).any(|skip| match_segments(&segments[1..], &parts[skip..]))
        }
        Some(Segment::Glob(pattern)) => {
            !parts.is_empty()
                && pattern.matches_with(parts[0], SEGMENT_OPTIONS)
                && match_segments(&segments[1..], &parts[1..])
        }
    }
}
