//! Concurrent build scheduling.
//!
//! The engine coordinates builds across the module graph with three
//! guarantees: at most one build per module for the whole run, every
//! dependency succeeds before its dependent touches the backend, and heavy
//! work (context assembly plus the backend call) runs under the worker
//! pool's concurrency cap. Dependency fan-out runs on plain coordination
//! threads so waiting on a child can never occupy a pool slot.

use crate::backend::{self, Backend, BuildRequest};
use crate::cache::DigestCache;
use crate::context::{self, TempArchive};
use crate::error::{KilnError, MultiError, Result};
use crate::hooks;
use crate::module::{BuildStatus, Module, ModuleRegistry};
use crate::options::BuildOptions;
use crate::pool::WorkerPool;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// The build engine: module registry, worker pool, digest cache, and the
/// selected backend.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    registry: ModuleRegistry,
    pool: WorkerPool,
    backend: Arc<dyn Backend>,
    cache: DigestCache,
}

impl Engine {
    /// Engine with the default digest cache location. A `concurrency` of
    /// zero sizes the pool to the number of CPUs.
    pub fn new(backend: Arc<dyn Backend>, concurrency: usize) -> Self {
        Self::with_config(backend, concurrency, DigestCache::new())
    }

    /// Engine with an explicit digest cache.
    pub fn with_config(
        backend: Arc<dyn Backend>,
        concurrency: usize,
        cache: DigestCache,
    ) -> Self {
        let concurrency = if concurrency == 0 { num_cpus::get() } else { concurrency };
        Self {
            inner: Arc::new(EngineInner {
                registry: ModuleRegistry::new(),
                pool: WorkerPool::new(concurrency),
                backend,
                cache,
            }),
        }
    }

    /// Resolve a manifest path (empty means `./kiln.yaml`) into an interned
    /// module with all transitive dependencies linked.
    pub fn get_module(&self, manifest_path: impl AsRef<Path>) -> Result<Arc<Module>> {
        self.inner.registry.get_module(manifest_path.as_ref())
    }

    /// Build a module and everything it depends on.
    ///
    /// Exactly one caller wins the module's claim and owns the build; every
    /// other concurrent caller blocks and receives the identical outcome.
    pub fn build(&self, module: &Arc<Module>, options: &BuildOptions) -> Result<()> {
        if !module.claim() {
            return match module.status() {
                BuildStatus::Succeeded => Ok(()),
                BuildStatus::Failed => {
                    Err(KilnError::Build(module.error().unwrap_or_default()))
                }
                BuildStatus::Pending | BuildStatus::InProgress => {
                    module.wait_for_completion().map_err(KilnError::Build)
                }
            };
        }
        let result = self.run_build(module, options);
        module.broadcast(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(e.to_string()),
        });
        result
    }

    /// The claimed build: dependencies first, then the module's own image.
    fn run_build(&self, module: &Arc<Module>, options: &BuildOptions) -> Result<()> {
        self.build_dependencies(module, options)?;
        let build = match &module.spec().build {
            Some(build) => build,
            // A pure aggregation module is done once its dependencies are.
            None => return Ok(()),
        };
        if !build.builder.is_empty() && build.builder != self.inner.backend.name() {
            return Err(KilnError::Backend {
                message: format!(
                    "module '{}' requires builder '{}' but the engine backend is '{}'",
                    module.dir().display(),
                    build.builder,
                    self.inner.backend.name()
                ),
            });
        }
        let engine = self.clone();
        let job_module = Arc::clone(module);
        let job_options = options.clone();
        let receiver = self.inner.pool.submit(move || engine.do_build(&job_module, &job_options));
        receiver
            .recv()
            .unwrap_or_else(|_| Err(KilnError::Build("build worker exited unexpectedly".into())))
    }

    /// Fan dependencies out on coordination threads, one per child, and
    /// aggregate failures in declared order. Siblings of a failed child are
    /// awaited, not cancelled, so their partial progress still lands in the
    /// digest cache.
    fn build_dependencies(&self, module: &Arc<Module>, options: &BuildOptions) -> Result<()> {
        let dependencies = module.dependencies();
        if dependencies.is_empty() {
            return Ok(());
        }
        let mut handles = Vec::with_capacity(dependencies.len());
        for (index, dependency) in dependencies.iter().enumerate() {
            let engine = self.clone();
            let dependency = Arc::clone(dependency);
            let options = options.clone();
            let declared = module
                .spec()
                .dependencies
                .get(index)
                .cloned()
                .unwrap_or_else(|| dependency.dir().display().to_string());
            handles.push(std::thread::spawn(move || {
                engine
                    .build(&dependency, &options)
                    .map_err(|e| format!("dependency '{}': {}", declared, e))
            }));
        }
        let mut failures = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(message)) => failures.push(message),
                Err(_) => failures.push("dependency build thread panicked".to_string()),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(KilnError::DependencyFailures(MultiError(failures)))
        }
    }

    /// Heavy leaf work, always executed inside the worker pool: assemble
    /// the context, compare digests, and drive the backend when stale.
    fn do_build(&self, module: &Arc<Module>, options: &BuildOptions) -> Result<()> {
        let build = match &module.spec().build {
            Some(build) => build,
            None => return Ok(()),
        };
        let assembled = context::assemble(module.dir(), build)?;
        let digest = context::digest(&assembled.context, &assembled.include);
        if !options.no_cache {
            if let Some(cached) = self.inner.cache.cached_digest(module.dir()) {
                if cached == digest {
                    info!(
                        dir = %module.dir().display(),
                        digest = %digest,
                        "no files changed"
                    );
                    return Ok(());
                }
            }
        }
        if !options.skip_hooks {
            hooks::run_commands("pre-build", &build.before, module.dir())?;
        }
        let tar = context::archive(&assembled.context)?;
        let _archive_file = TempArchive::write(&tar)?;
        let image =
            backend::sanitize_image_name(options.repository.as_deref(), &build.name, &options.tag);
        let request = BuildRequest {
            image: image.clone(),
            build_args: build
                .build_args
                .iter()
                .map(|arg| (arg.name.clone(), arg.value.clone()))
                .collect(),
            no_cache: options.no_cache,
            squash: options.squash,
            target: if build.target.is_empty() {
                options.target.clone()
            } else {
                Some(build.target.clone())
            },
            push: options.push,
        };
        info!(
            tag = %image,
            backend = self.inner.backend.name(),
            no_cache = options.no_cache,
            "building image"
        );
        self.inner
            .backend
            .build(&tar, &assembled.relative_recipe, &request)
            .map_err(|e| KilnError::Backend {
                message: format!("{}: {}", self.inner.backend.name(), e),
            })?;
        if let Err(e) = self.inner.cache.record_digest(module.dir(), &digest) {
            // Advisory state only; the image itself is already built.
            warn!(dir = %module.dir().display(), error = %e, "failed to record digest");
        }
        if !options.skip_hooks {
            hooks::run_commands("post-build", &build.after, module.dir())?;
        }
        info!(tag = %image, "successfully built image");
        Ok(())
    }
}
