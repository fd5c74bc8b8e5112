//! Local container engine driver.
//!
//! Streams the context archive to the daemon's image-build endpoint and
//! decodes the line-delimited JSON progress stream, forwarding build output
//! to the log and promoting engine-reported errors to failures. Pushing
//! reuses the same streaming shape with credentials from the environment.

use crate::backend::{registry_auth_from_env, Backend, BuildRequest};
use crate::error::{KilnError, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use tracing::{debug, info};

/// Request passed to the daemon's image-build endpoint.
#[derive(Debug, Clone)]
pub struct ImageBuildRequest {
    /// Recipe path within the streamed context archive.
    pub dockerfile: String,
    pub tags: Vec<String>,
    pub build_args: Vec<(String, String)>,
    pub no_cache: bool,
    pub squash: bool,
    pub target: Option<String>,
}

/// Transport to a local container engine daemon. Implemented by the
/// embedder; the returned readers yield the daemon's line-delimited JSON
/// progress messages.
pub trait ImageEngine: Send + Sync {
    /// Cheap reachability probe used by backend auto-selection.
    fn ping(&self) -> Result<()>;

    fn image_build(
        &self,
        context_tar: &[u8],
        request: &ImageBuildRequest,
    ) -> Result<Box<dyn Read + Send>>;

    fn image_push(&self, image: &str, registry_auth: &str) -> Result<Box<dyn Read + Send>>;
}

/// The `docker` backend.
pub struct DockerBackend {
    engine: Arc<dyn ImageEngine>,
}

impl DockerBackend {
    pub fn new(engine: Arc<dyn ImageEngine>) -> Self {
        Self { engine }
    }

    pub fn into_arc(self) -> Arc<dyn Backend> {
        Arc::new(self)
    }
}

impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn build(&self, context_tar: &[u8], recipe_path: &str, request: &BuildRequest) -> Result<()> {
        let build_request = ImageBuildRequest {
            dockerfile: recipe_path.to_string(),
            tags: vec![request.image.clone()],
            build_args: request.build_args.clone(),
            no_cache: request.no_cache,
            squash: request.squash,
            target: request.target.clone(),
        };
        let stream = self.engine.image_build(context_tar, &build_request)?;
        stream_progress(stream)?;
        if request.push {
            let auth = registry_auth_from_env()?;
            info!(username = %auth.username, image = %request.image, "pushing image");
            let blob = serde_json::to_vec(&auth).map_err(|e| KilnError::Backend {
                message: format!("failed to encode registry auth: {}", e),
            })?;
            let stream = self.engine.image_push(&request.image, &URL_SAFE.encode(blob))?;
            stream_progress(stream)?;
            info!(image = %request.image, "pushed image");
        }
        Ok(())
    }
}

/// One progress message from the daemon.
#[derive(Debug, Deserialize)]
struct ProgressMessage {
    stream: Option<String>,
    status: Option<String>,
    error: Option<String>,
    #[serde(rename = "errorDetail")]
    error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

/// Decode and log a progress stream. The reader is always drained so the
/// transport can reclaim its connection; the first reported error becomes
/// the build failure.
fn stream_progress(reader: Box<dyn Read + Send>) -> Result<()> {
    let reader = BufReader::new(reader);
    let mut failure: Option<String> = None;
    for line in reader.lines() {
        let line = line
            .map_err(|e| KilnError::Backend { message: format!("progress stream: {}", e) })?;
        if line.trim().is_empty() {
            continue;
        }
        let message: ProgressMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(_) => {
                debug!(line = %line, "unparsed progress line");
                continue;
            }
        };
        let error = message
            .error_detail
            .and_then(|detail| detail.message)
            .or(message.error);
        if let Some(error) = error {
            if failure.is_none() {
                failure = Some(error);
            }
            continue;
        }
        if let Some(stream) = message.stream {
            let trimmed = stream.trim_end();
            if !trimmed.is_empty() {
                info!("{}", trimmed);
            }
        } else if let Some(status) = message.status {
            debug!("{}", status);
        }
    }
    match failure {
        Some(message) => Err(KilnError::Backend { message }),
        None => Ok(()),
    }
}
