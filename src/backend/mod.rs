//! Backend drivers.
//!
//! A backend turns an assembled context archive plus a recipe reference
//! into an image. Two drivers exist: `docker` talks to a local container
//! engine daemon, `kaniko` runs an executor pod inside a cluster. The
//! transports themselves (daemon API, cluster API, exec streaming) are
//! supplied by the embedder through the `ImageEngine` and `ClusterClient`
//! traits.

pub mod cluster;
pub mod docker;

pub use cluster::{ClusterBackend, ClusterClient, ExecResult, PodPhase, PodSpec};
pub use docker::{DockerBackend, ImageBuildRequest, ImageEngine};

use crate::error::{KilnError, Result};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;

/// Everything a backend needs for one build, already resolved from the
/// module's manifest and the run options.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Fully qualified destination tag.
    pub image: String,
    /// Build arguments in declared order.
    pub build_args: Vec<(String, String)>,
    pub no_cache: bool,
    pub squash: bool,
    pub target: Option<String>,
    pub push: bool,
}

/// Backend driver contract.
pub trait Backend: Send + Sync {
    /// Stable driver name, also the value accepted by the manifest's
    /// `builder` field.
    fn name(&self) -> &'static str;

    /// Run one image build from an uncompressed tar context.
    /// `recipe_path` is the recipe's location within the archive.
    fn build(&self, context_tar: &[u8], recipe_path: &str, request: &BuildRequest) -> Result<()>;
}

/// Backend selector carried in the build options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Use the local engine when reachable, the cluster otherwise.
    #[default]
    Auto,
    Local,
    Cluster,
}

impl FromStr for BackendKind {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "auto" => Ok(Self::Auto),
            "local" | "docker" => Ok(Self::Local),
            "cluster" | "kaniko" => Ok(Self::Cluster),
            other => Err(KilnError::UnknownBackend { name: other.to_string() }),
        }
    }
}

impl BackendKind {
    /// Resolve the selector against the transports the embedder supplied.
    pub fn resolve(
        self,
        engine: Option<Arc<dyn ImageEngine>>,
        cluster: Option<Arc<dyn ClusterClient>>,
    ) -> Result<Arc<dyn Backend>> {
        match self {
            Self::Local => engine.map(|e| DockerBackend::new(e).into_arc()).ok_or_else(|| {
                KilnError::Backend { message: "local backend requested but no image engine configured".into() }
            }),
            Self::Cluster => cluster.map(|c| ClusterBackend::new(c).into_arc()).ok_or_else(|| {
                KilnError::Backend { message: "cluster backend requested but no cluster client configured".into() }
            }),
            Self::Auto => {
                if let Some(engine) = engine {
                    if engine.ping().is_ok() {
                        return Ok(DockerBackend::new(engine).into_arc());
                    }
                }
                cluster.map(|c| ClusterBackend::new(c).into_arc()).ok_or_else(|| {
                    KilnError::Backend {
                        message: "no local engine reachable and no cluster client configured"
                            .into(),
                    }
                })
            }
        }
    }
}

/// Registry credentials read from the environment for pushes.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Read push credentials from `DOCKER_USERNAME` / `DOCKER_PASSWORD`.
pub fn registry_auth_from_env() -> Result<RegistryAuth> {
    let username = std::env::var("DOCKER_USERNAME")
        .map_err(|_| KilnError::MissingEnv { var: "DOCKER_USERNAME".into() })?;
    let password = std::env::var("DOCKER_PASSWORD")
        .map_err(|_| KilnError::MissingEnv { var: "DOCKER_PASSWORD".into() })?;
    Ok(RegistryAuth { username, password })
}

/// Build the destination tag: `[<repository>/]<name>:<tag or latest>`.
pub fn sanitize_image_name(repository: Option<&str>, name: &str, tag: &str) -> String {
    let tag = if tag.is_empty() { "latest" } else { tag };
    match repository {
        Some(repository) if !repository.is_empty() => {
            format!("{}/{}:{}", repository.trim_end_matches('/'), name, tag)
        }
        _ => format!("{}:{}", name, tag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    struct PingableEngine {
        reachable: bool,
    }

    impl ImageEngine for PingableEngine {
        fn ping(&self) -> Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(KilnError::Backend { message: "daemon unreachable".into() })
            }
        }

        fn image_build(
            &self,
            _context_tar: &[u8],
            _request: &ImageBuildRequest,
        ) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(std::io::empty()))
        }

        fn image_push(&self, _image: &str, _auth: &str) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(std::io::empty()))
        }
    }

    struct NullCluster;

    impl ClusterClient for NullCluster {
        fn create_pod(&self, _spec: &PodSpec) -> Result<()> {
            Ok(())
        }

        fn pod_phase(&self, _namespace: &str, _name: &str) -> Result<PodPhase> {
            Ok(PodPhase::Running)
        }

        fn exec(
            &self,
            _namespace: &str,
            _name: &str,
            _command: &[String],
            _stdin: Option<&[u8]>,
        ) -> Result<ExecResult> {
            Ok(ExecResult { exit_code: 0, stdout: Vec::new(), stderr: Vec::new() })
        }

        fn delete_pod(&self, _namespace: &str, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_auto_prefers_reachable_local_engine() {
        let backend = BackendKind::Auto
            .resolve(Some(Arc::new(PingableEngine { reachable: true })), Some(Arc::new(NullCluster)))
            .unwrap();
        assert_eq!(backend.name(), "docker");
    }

    #[test]
    fn test_auto_falls_back_to_cluster() {
        let backend = BackendKind::Auto
            .resolve(
                Some(Arc::new(PingableEngine { reachable: false })),
                Some(Arc::new(NullCluster)),
            )
            .unwrap();
        assert_eq!(backend.name(), "kaniko");
    }

    #[test]
    fn test_explicit_selection_requires_transport() {
        assert!(BackendKind::Local.resolve(None, Some(Arc::new(NullCluster))).is_err());
        assert!(BackendKind::Cluster.resolve(None, None).is_err());
        let backend = BackendKind::Cluster.resolve(None, Some(Arc::new(NullCluster))).unwrap();
        assert_eq!(backend.name(), "kaniko");
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("auto".parse::<BackendKind>().unwrap(), BackendKind::Auto);
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("docker".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("cluster".parse::<BackendKind>().unwrap(), BackendKind::Cluster);
        assert_eq!("kaniko".parse::<BackendKind>().unwrap(), BackendKind::Cluster);
        assert!(matches!(
            "podman".parse::<BackendKind>(),
            Err(KilnError::UnknownBackend { .. })
        ));
    }

    #[test]
    fn test_sanitize_image_name() {
        assert_eq!(sanitize_image_name(None, "test/foo", ""), "test/foo:latest");
        assert_eq!(sanitize_image_name(None, "test/foo", "v1"), "test/foo:v1");
        assert_eq!(
            sanitize_image_name(Some("registry.local:5000"), "test/foo", "v1"),
            "registry.local:5000/test/foo:v1"
        );
        assert_eq!(
            sanitize_image_name(Some("registry.local/"), "test/foo", ""),
            "registry.local/test/foo:latest"
        );
        assert_eq!(sanitize_image_name(Some(""), "test/foo", ""), "test/foo:latest");
    }

}
