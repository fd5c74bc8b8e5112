//! kiln core library
//!
//! A monorepo-oriented container image build orchestrator. Each build
//! module is declared by a `kiln.yaml` manifest colocated with its sources;
//! the engine builds the whole dependency graph concurrently, deduplicates
//! work through a content-addressed digest cache, and drives image
//! construction through a local container engine or an on-cluster executor
//! pod.
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln::{BuildOptions, Engine};
//!
//! # fn engine_backend() -> Arc<dyn kiln::Backend> { unimplemented!() }
//! let options = BuildOptions::default();
//! let engine = Engine::new(engine_backend(), options.concurrency);
//! let module = engine.get_module("./kiln.yaml")?;
//! engine.build(&module, &options)?;
//! # Ok::<(), kiln::KilnError>(())
//! ```

pub mod backend;
pub mod cache;
pub mod context;
pub mod error;
pub mod hooks;
pub mod manifest;
pub mod module;
pub mod observability;
pub mod options;
pub mod paths;
pub mod pool;
pub mod scheduler;

// Re-export commonly used items
pub use backend::{
    Backend, BackendKind, BuildRequest, ClusterBackend, ClusterClient, DockerBackend,
    ImageEngine,
};
pub use cache::DigestCache;
pub use context::{BuildContext, IgnoreMatcher};
pub use error::{KilnError, Result};
pub use manifest::{BuildArg, BuildSpec, Manifest, MANIFEST_NAME};
pub use module::{BuildStatus, Module, ModuleRegistry};
pub use options::BuildOptions;
pub use scheduler::Engine;
