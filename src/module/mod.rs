//! Build modules and their lifecycle.
//!
//! A module is one unit of build, keyed by its manifest's directory. Its
//! status advances strictly `Pending -> InProgress -> {Succeeded, Failed}`
//! and terminal states are sticky for the module's lifetime. Exactly one
//! thread wins the claim on a module; everyone else subscribes and receives
//! the identical outcome.

pub mod registry;

pub use registry::ModuleRegistry;

use crate::manifest::Manifest;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};

/// Build lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BuildStatus {
    Pending = 0,
    InProgress = 1,
    Failed = 2,
    Succeeded = 3,
}

impl BuildStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::InProgress,
            2 => Self::Failed,
            3 => Self::Succeeded,
            other => unreachable!("invalid build status {}", other),
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Failed => "Failed",
            Self::Succeeded => "Succeeded",
        };
        f.write_str(name)
    }
}

/// Outcome delivered to every subscriber: success, or the failure message
/// recorded by the building thread.
pub type Outcome = std::result::Result<(), String>;

/// One build module. Interned per canonical manifest path, so the same
/// module referenced by several parents is a single node.
#[derive(Debug)]
pub struct Module {
    dir: PathBuf,
    manifest_path: PathBuf,
    spec: Manifest,
    dependencies: Vec<Arc<Module>>,
    status: AtomicU8,
    shared: Mutex<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    subscribers: Vec<mpsc::Sender<Outcome>>,
    /// Set if and only if the module failed. Published before the terminal
    /// status store so lock-free status readers always see it.
    error: Option<String>,
}

impl Module {
    pub(crate) fn new(
        dir: PathBuf,
        manifest_path: PathBuf,
        spec: Manifest,
        dependencies: Vec<Arc<Module>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dir,
            manifest_path,
            spec,
            dependencies,
            status: AtomicU8::new(BuildStatus::Pending as u8),
            shared: Mutex::new(Shared::default()),
        })
    }

    /// Absolute path of the module's root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path of the module's manifest.
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// The parsed manifest.
    pub fn spec(&self) -> &Manifest {
        &self.spec
    }

    /// Dependency modules in declared order.
    pub fn dependencies(&self) -> &[Arc<Module>] {
        &self.dependencies
    }

    /// Current status, readable lock-free.
    pub fn status(&self) -> BuildStatus {
        BuildStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// The failure message, present only in the `Failed` state.
    pub fn error(&self) -> Option<String> {
        if self.status() != BuildStatus::Failed {
            return None;
        }
        self.shared.lock().expect("module lock poisoned").error.clone()
    }

    /// Attempt the `Pending -> InProgress` transition. The winning thread
    /// owns the build and must eventually call `broadcast`.
    pub(crate) fn claim(&self) -> bool {
        self.status
            .compare_exchange(
                BuildStatus::Pending as u8,
                BuildStatus::InProgress as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Register for the module's outcome. A terminal module answers
    /// immediately; otherwise the returned channel fires on broadcast.
    pub(crate) fn subscribe(&self) -> mpsc::Receiver<Outcome> {
        let (tx, rx) = mpsc::channel();
        let mut shared = self.shared.lock().expect("module lock poisoned");
        match self.status() {
            BuildStatus::Pending | BuildStatus::InProgress => shared.subscribers.push(tx),
            BuildStatus::Succeeded => {
                let _ = tx.send(Ok(()));
            }
            BuildStatus::Failed => {
                let message = shared.error.clone().unwrap_or_default();
                let _ = tx.send(Err(message));
            }
        }
        rx
    }

    /// Publish the terminal state and deliver the outcome to every waiter.
    /// Holding the lock across the status store and the sends keeps the
    /// `(status, error)` pair consistent for late subscribers.
    pub(crate) fn broadcast(&self, outcome: Outcome) {
        let mut shared = self.shared.lock().expect("module lock poisoned");
        match &outcome {
            Ok(()) => {
                self.status.store(BuildStatus::Succeeded as u8, Ordering::Release);
            }
            Err(message) => {
                shared.error = Some(message.clone());
                self.status.store(BuildStatus::Failed as u8, Ordering::Release);
            }
        }
        for subscriber in shared.subscribers.drain(..) {
            let _ = subscriber.send(outcome.clone());
        }
    }

    /// Block until another thread finishes building this module and return
    /// the same outcome it broadcast.
    pub fn wait_for_completion(&self) -> Outcome {
        self.subscribe()
            .recv()
            .unwrap_or_else(|_| Err("build owner exited without broadcasting".to_string()))
    }
}
