//! On-cluster executor driver.
//!
//! Builds run inside an ephemeral executor pod: the driver creates the pod,
//! waits for it to reach Running, copies the user's registry credentials in,
//! then streams the gzipped context archive to the in-pod executor's stdin.
//! The pod is deleted on every exit path.

use crate::backend::{Backend, BuildRequest};
use crate::error::{KilnError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Image run in the executor pod.
pub const EXECUTOR_IMAGE: &str = "gcr.io/kaniko-project/executor:debug";

const POD_START_TIMEOUT: Duration = Duration::from_secs(120);
const POD_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Pod lifecycle phase as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Minimal pod description the driver needs.
#[derive(Debug, Clone)]
pub struct PodSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
}

/// Captured output of a remote exec.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Transport to the cluster API server. Implemented by the embedder.
pub trait ClusterClient: Send + Sync {
    fn create_pod(&self, spec: &PodSpec) -> Result<()>;

    fn pod_phase(&self, namespace: &str, name: &str) -> Result<PodPhase>;

    /// Run a command in the pod, optionally feeding `stdin`, capturing both
    /// output streams.
    fn exec(
        &self,
        namespace: &str,
        name: &str,
        command: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecResult>;

    fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

/// The `kaniko` backend.
pub struct ClusterBackend {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    docker_config: PathBuf,
}

impl ClusterBackend {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        let docker_config = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/root"))
            .join(".docker")
            .join("config.json");
        Self { client, namespace: "default".to_string(), docker_config }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Override the registry credentials file copied into the pod.
    pub fn with_docker_config(mut self, path: PathBuf) -> Self {
        self.docker_config = path;
        self
    }

    pub fn into_arc(self) -> Arc<dyn Backend> {
        Arc::new(self)
    }

    fn wait_for_pod(&self, name: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.client.pod_phase(&self.namespace, name)? {
                PodPhase::Running => return Ok(()),
                PodPhase::Failed => {
                    return Err(KilnError::Backend {
                        message: format!("executor pod '{}' failed to start", name),
                    })
                }
                phase => {
                    debug!(pod = name, phase = ?phase, "waiting for executor pod");
                }
            }
            if started.elapsed() >= POD_START_TIMEOUT {
                return Err(KilnError::PodStartTimeout {
                    name: name.to_string(),
                    timeout_secs: POD_START_TIMEOUT.as_secs(),
                });
            }
            std::thread::sleep(POD_POLL_INTERVAL);
        }
    }

    /// Copy the user's registry credentials into the pod so pushes
    /// authenticate. Missing credentials are fine; pushes just go
    /// unauthenticated.
    fn copy_registry_credentials(&self, name: &str) -> Result<()> {
        let body = match std::fs::read(&self.docker_config) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(KilnError::io(&self.docker_config, e)),
        };
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "mkdir -p /kaniko/.docker && cat > /kaniko/.docker/config.json".to_string(),
        ];
        let result = self.client.exec(&self.namespace, name, &command, Some(&body))?;
        if result.exit_code != 0 {
            return Err(KilnError::Backend {
                message: format!("failed to copy registry credentials into pod '{}'", name),
            });
        }
        info!(pod = name, "copied registry credentials to executor pod");
        Ok(())
    }
}

impl Backend for ClusterBackend {
    fn name(&self) -> &'static str {
        "kaniko"
    }

    fn build(&self, context_tar: &[u8], recipe_path: &str, request: &BuildRequest) -> Result<()> {
        let pod = PodSpec {
            name: format!("kiln-executor-{}", &Uuid::new_v4().simple().to_string()[..8]),
            namespace: self.namespace.clone(),
            image: EXECUTOR_IMAGE.to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), "tail -f /dev/null".to_string()],
        };
        self.client.create_pod(&pod)?;
        let _guard = PodGuard { client: Arc::clone(&self.client), pod: pod.clone() };
        self.wait_for_pod(&pod.name)?;
        self.copy_registry_credentials(&pod.name)?;

        let mut command = vec![
            "/kaniko/executor".to_string(),
            format!("--dockerfile={}", recipe_path),
            "--context=tar://stdin".to_string(),
        ];
        if request.push {
            command.push(format!("--destination={}", request.image));
        } else {
            command.push("--no-push".to_string());
        }
        if let Some(target) = &request.target {
            command.push(format!("--target={}", target));
        }
        for (name, value) in &request.build_args {
            command.push(format!("--build-arg={}={}", name, value));
        }

        let compressed = gzip(context_tar)?;
        info!(pod = %pod.name, image = %request.image, "building on-cluster");
        let result = self.client.exec(&self.namespace, &pod.name, &command, Some(&compressed))?;
        if !result.stdout.is_empty() {
            debug!("{}", String::from_utf8_lossy(&result.stdout));
        }
        if !result.stderr.is_empty() {
            debug!("{}", String::from_utf8_lossy(&result.stderr));
        }
        if result.exit_code != 0 {
            let message = last_nonempty_line(&result.stderr).unwrap_or_else(|| {
                format!("executor exited with code {}", result.exit_code)
            });
            return Err(KilnError::Backend { message });
        }
        Ok(())
    }
}

/// Deletes the executor pod when the build unwinds, success or not.
struct PodGuard {
    client: Arc<dyn ClusterClient>,
    pod: PodSpec,
}

impl Drop for PodGuard {
    fn drop(&mut self) {
        if let Err(e) = self.client.delete_pod(&self.pod.namespace, &self.pod.name) {
            error!(pod = %self.pod.name, error = %e, "failed to delete executor pod");
        }
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| KilnError::Backend { message: format!("failed to gzip context: {}", e) })?;
    encoder
        .finish()
        .map_err(|e| KilnError::Backend { message: format!("failed to gzip context: {}", e) })
}

/// The executor prints its fatal error last; surface that line.
fn last_nonempty_line(stderr: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stderr)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
