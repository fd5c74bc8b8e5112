//! Build options shared across the engine.

use crate::backend::BackendKind;

/// Options for a build run. Carried unchanged through the whole module
/// graph; per-module knobs come from each manifest.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Image tag. Empty means `latest`.
    pub tag: String,
    /// Skip the digest cache and force the backend to rebuild every layer.
    pub no_cache: bool,
    /// Squash newly built layers into a single layer (engine experimental
    /// feature, passed through).
    pub squash: bool,
    /// Push built images to their registry.
    pub push: bool,
    /// Number of concurrent heavy build jobs. Zero means one per CPU.
    pub concurrency: usize,
    /// Backend selector.
    pub backend: BackendKind,
    /// Multi-stage target used when a module's manifest does not set one.
    pub target: Option<String>,
    /// Skip pre- and post-build hooks.
    pub skip_hooks: bool,
    /// Repository prefix prepended to image names, e.g. a private registry
    /// host.
    pub repository: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            tag: String::new(),
            no_cache: false,
            squash: false,
            push: false,
            concurrency: 0,
            backend: BackendKind::Auto,
            target: None,
            skip_hooks: false,
            repository: None,
        }
    }
}
