//! Module interning and graph resolution.
//!
//! The registry maps canonical manifest paths to modules so a module
//! referenced by several parents resolves to a single node. The lock only
//! covers lookup-or-insert; each node is marked as resolving before its
//! dependencies are expanded, which is what turns a cyclic declaration into
//! an error instead of unbounded recursion.

use crate::error::{KilnError, Result};
use crate::manifest::{Manifest, MANIFEST_NAME};
use crate::module::Module;
use crate::paths;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug)]
enum Slot {
    /// Dependency expansion in flight; revisiting this entry is a cycle.
    Resolving,
    Ready(Arc<Module>),
}

/// Engine-scoped module table. Entries are never removed while the engine
/// lives, except to clear the resolving marker of a failed load.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Mutex<HashMap<PathBuf, Slot>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a manifest path to a fully linked module. An empty path
    /// means `./kiln.yaml` in the current directory.
    pub fn get_module(&self, manifest_path: &Path) -> Result<Arc<Module>> {
        let requested = if manifest_path.as_os_str().is_empty() {
            std::env::current_dir()
                .map_err(|e| KilnError::io(manifest_path, e))?
                .join(MANIFEST_NAME)
        } else {
            manifest_path.to_path_buf()
        };
        self.resolve(&requested)
    }

    fn resolve(&self, requested: &Path) -> Result<Arc<Module>> {
        let canonical = std::fs::canonicalize(requested)
            .map_err(|_| KilnError::ManifestNotFound { path: requested.to_path_buf() })?;
        {
            let mut modules = self.modules.lock().expect("registry lock poisoned");
            match modules.get(&canonical) {
                Some(Slot::Ready(module)) => return Ok(Arc::clone(module)),
                Some(Slot::Resolving) => {
                    return Err(KilnError::CyclicDependency { path: canonical })
                }
                None => {
                    modules.insert(canonical.clone(), Slot::Resolving);
                }
            }
        }
        let result = self.load(&canonical);
        let mut modules = self.modules.lock().expect("registry lock poisoned");
        match &result {
            Ok(module) => {
                modules.insert(canonical, Slot::Ready(Arc::clone(module)));
            }
            Err(_) => {
                modules.remove(&canonical);
            }
        }
        result
    }

    fn load(&self, manifest_path: &Path) -> Result<Arc<Module>> {
        let spec = Manifest::load(manifest_path)?;
        let dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        spec.validate(&dir)?;
        let mut dependencies = Vec::with_capacity(spec.dependencies.len());
        for (index, declared) in spec.dependencies.iter().enumerate() {
            let dep_manifest = paths::clean(&dir.join(declared).join(MANIFEST_NAME));
            let module = self
                .resolve(&dep_manifest)
                .map_err(|e| KilnError::Dependency { index, source: Box::new(e) })?;
            dependencies.push(module);
        }
        debug!(
            dir = %dir.display(),
            dependencies = dependencies.len(),
            "resolved module"
        );
        Ok(Module::new(dir, manifest_path.to_path_buf(), spec, dependencies))
    }
}
