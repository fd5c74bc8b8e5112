//! Error types for kiln.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Main error type for kiln.
#[derive(Error, Debug)]
pub enum KilnError {
    // Manifest errors
    #[error("missing kiln.yaml at '{path}'")]
    ManifestNotFound { path: PathBuf },

    #[error("failed to parse '{path}': {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("missing image name")]
    MissingImageName,

    #[error("missing Dockerfile at '{path}'")]
    MissingRecipe { path: PathBuf },

    #[error("unknown builder '{name}'")]
    UnknownBuilder { name: String },

    #[error("unknown backend '{name}'")]
    UnknownBackend { name: String },

    // Graph errors
    #[error("cyclic dependency detected at '{path}'")]
    CyclicDependency { path: PathBuf },

    #[error("dependency {index}: {source}")]
    Dependency {
        index: usize,
        #[source]
        source: Box<KilnError>,
    },

    #[error("{0}")]
    DependencyFailures(MultiError),

    // Build-context errors
    #[error("build context not found at '{path}'")]
    ContextNotFound { path: PathBuf },

    #[error("failed to stat '{path}'")]
    MissingContextPath { path: PathBuf },

    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    // Backend errors
    #[error("{message}")]
    Backend { message: String },

    #[error("executor pod '{name}' did not reach Running within {timeout_secs}s")]
    PodStartTimeout { name: String, timeout_secs: u64 },

    #[error("missing {var}")]
    MissingEnv { var: String },

    // Hook errors
    #[error("{phase} hook failure: {message}")]
    Hook { phase: String, message: String },

    /// A build outcome relayed from the thread that owned the build.
    #[error("{0}")]
    Build(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Aggregate of several failure messages, one per failing dependency, in
/// declared order.
#[derive(Debug)]
pub struct MultiError(pub Vec<String>);

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "no errors"),
            [single] => f.write_str(single),
            entries => {
                write!(f, "{} errors occurred: ", entries.len())?;
                for (i, entry) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    f.write_str(entry)?;
                }
                Ok(())
            }
        }
    }
}

impl KilnError {
    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
