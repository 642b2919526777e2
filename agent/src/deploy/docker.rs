//! Docker image pulls and update resolution

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use futures::StreamExt;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::deploy::compose::{ComposeDriver, ComposeTarget};
use crate::deploy::pull::{ImagePuller, PullEvent};
use crate::errors::AppError;
use crate::models::operation::ProgressDetail;

/// Split an image reference into the `fromImage` and `tag` of a pull.
///
/// `redis` -> (`redis`, `latest`), `localhost:5000/app:1.2` -> (`localhost:5000/app`, `1.2`).
/// Digest references are pulled as-is with an empty tag.
pub fn split_image_reference(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }

    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

/// [`ImagePuller`] talking to the Docker engine API
pub struct DockerPuller {
    docker: Docker,
}

impl DockerPuller {
    /// Connect to the local Docker engine
    pub fn connect() -> Result<Self, AppError> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
        })
    }
}

#[async_trait]
impl ImagePuller for DockerPuller {
    async fn pull(
        &self,
        image: &str,
        on_event: &(dyn Fn(PullEvent) + Send + Sync),
    ) -> Result<(), AppError> {
        let (from_image, tag) = split_image_reference(image);
        debug!("Pulling image {} (tag {})", from_image, tag);

        #[allow(deprecated)]
        let options = bollard::image::CreateImageOptions {
            from_image: from_image.as_str(),
            tag: tag.as_str(),
            ..Default::default()
        };

        #[allow(deprecated)]
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(info) = stream.next().await {
            let info =
                info.map_err(|e| AppError::ImagePullError(format!("Failed to pull {}: {}", image, e)))?;

            on_event(PullEvent {
                status: info.status.unwrap_or_default(),
                progress_detail: info.progress_detail.map(|detail| ProgressDetail {
                    current: detail.current.and_then(|c| u64::try_from(c).ok()),
                    total: detail.total.and_then(|t| u64::try_from(t).ok()),
                    percent: None,
                }),
            });
        }

        Ok(())
    }
}

/// Outcome of comparing local and remote image digests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResolution {
    pub update_available: bool,
    pub local_digest: Option<String>,
    pub remote_digest: Option<String>,
}

/// Update resolution collaborator
#[async_trait]
pub trait UpdateResolver: Send + Sync {
    async fn resolve_update_state(&self, target: &ComposeTarget) -> Result<UpdateResolution, AppError>;
}

/// [`UpdateResolver`] comparing `docker image inspect` with the registry manifest
pub struct CliUpdateResolver {
    compose: Arc<dyn ComposeDriver>,
    docker_command: String,
}

impl CliUpdateResolver {
    pub fn new(compose: Arc<dyn ComposeDriver>, docker_command: String) -> Self {
        Self {
            compose,
            docker_command,
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<String, AppError> {
        let output = Command::new(&self.docker_command)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AppError::ComposeError(format!("Failed to run {}: {}", self.docker_command, e)))?;

        if !output.status.success() {
            return Err(AppError::ComposeError(format!(
                "docker {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn local_digest(&self, image: &str) -> Result<Option<String>, AppError> {
        let output = self
            .docker(&["image", "inspect", "--format", "{{json .RepoDigests}}", image])
            .await?;
        parse_repo_digests(&output)
    }

    async fn remote_digest(&self, image: &str) -> Result<Option<String>, AppError> {
        let output = self
            .docker(&["buildx", "imagetools", "inspect", "--format", "{{json .Manifest}}", image])
            .await?;
        parse_manifest_digest(&output)
    }
}

#[async_trait]
impl UpdateResolver for CliUpdateResolver {
    async fn resolve_update_state(&self, target: &ComposeTarget) -> Result<UpdateResolution, AppError> {
        let images = self.compose.extract_images(target).await?;
        let mut resolution = UpdateResolution::default();

        for image in &images {
            let local = match self.local_digest(image).await {
                Ok(digest) => digest,
                Err(e) => {
                    warn!("Unable to inspect local image {}: {}", image, e);
                    None
                }
            };
            let remote = match self.remote_digest(image).await {
                Ok(digest) => digest,
                Err(e) => {
                    warn!("Unable to inspect remote image {}: {}", image, e);
                    None
                }
            };

            let outdated = matches!((&local, &remote), (Some(l), Some(r)) if l != r);
            debug!(
                "Image {} local={:?} remote={:?} outdated={}",
                image, local, remote, outdated
            );

            // Report the first outdated image, or the first image otherwise
            if outdated && !resolution.update_available {
                resolution = UpdateResolution {
                    update_available: true,
                    local_digest: local,
                    remote_digest: remote,
                };
            } else if !resolution.update_available
                && resolution.local_digest.is_none()
                && resolution.remote_digest.is_none()
            {
                resolution.local_digest = local;
                resolution.remote_digest = remote;
            }
        }

        Ok(resolution)
    }
}

/// First digest of `{{json .RepoDigests}}` output, e.g. `["nginx@sha256:..."]`
pub fn parse_repo_digests(output: &str) -> Result<Option<String>, AppError> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    let digests: Vec<String> = serde_json::from_str(trimmed)?;
    Ok(digests
        .first()
        .and_then(|d| d.split_once('@'))
        .map(|(_, digest)| digest.to_string()))
}

#[derive(Deserialize)]
struct Manifest {
    digest: Option<String>,
}

/// Digest of `{{json .Manifest}}` output
pub fn parse_manifest_digest(output: &str) -> Result<Option<String>, AppError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let manifest: Manifest = serde_json::from_str(trimmed)?;
    Ok(manifest.digest)
}
