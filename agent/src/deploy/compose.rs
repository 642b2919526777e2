//! Docker Compose subprocess driver

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::AppError;
use crate::models::stack::{ContainerState, InstalledStackConfig, MaterializedStack, RuntimeInfo};

/// The files and project name one compose invocation works on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeTarget {
    pub compose_path: PathBuf,
    pub env_path: PathBuf,
    pub stack_name: String,
}

impl From<&InstalledStackConfig> for ComposeTarget {
    fn from(stack: &InstalledStackConfig) -> Self {
        Self {
            compose_path: stack.compose_path.clone(),
            env_path: stack.env_path(),
            stack_name: stack.stack_name.clone(),
        }
    }
}

impl From<&MaterializedStack> for ComposeTarget {
    fn from(stack: &MaterializedStack) -> Self {
        Self {
            compose_path: stack.compose_path.clone(),
            env_path: stack.env_path.clone(),
            stack_name: stack.stack_name.clone(),
        }
    }
}

/// Compose tool collaborator
#[async_trait]
pub trait ComposeDriver: Send + Sync {
    async fn up(&self, target: &ComposeTarget) -> Result<(), AppError>;

    async fn down(&self, target: &ComposeTarget, remove_volumes: bool) -> Result<(), AppError>;

    async fn start(&self, target: &ComposeTarget) -> Result<(), AppError>;

    async fn stop(&self, target: &ComposeTarget) -> Result<(), AppError>;

    async fn restart(&self, target: &ComposeTarget) -> Result<(), AppError>;

    /// Images referenced by the rendered compose definition
    async fn extract_images(&self, target: &ComposeTarget) -> Result<Vec<String>, AppError>;

    async fn get_runtime_info(&self, target: &ComposeTarget) -> Result<RuntimeInfo, AppError>;

    /// Remove a named volume left behind by a stack
    async fn remove_volume(&self, name: &str) -> Result<(), AppError>;
}

/// [`ComposeDriver`] shelling out to the compose CLI
#[derive(Debug, Clone)]
pub struct ComposeCli {
    /// Program and leading arguments, e.g. `docker compose`
    command: Vec<String>,
    docker_command: String,
}

impl ComposeCli {
    pub fn new(command: Vec<String>, docker_command: String) -> Self {
        Self {
            command,
            docker_command,
        }
    }

    async fn compose(&self, target: &ComposeTarget, args: &[&str]) -> Result<String, AppError> {
        let (program, prefix) = self
            .command
            .split_first()
            .ok_or_else(|| AppError::ConfigError("Compose command is empty".to_string()))?;

        debug!(
            "Running compose {} for stack {}",
            args.join(" "),
            target.stack_name
        );

        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .arg("--project-name")
            .arg(&target.stack_name)
            .arg("--file")
            .arg(&target.compose_path);
        if tokio::fs::metadata(&target.env_path).await.is_ok() {
            cmd.arg("--env-file").arg(&target.env_path);
        }
        if let Some(dir) = target.compose_path.parent() {
            cmd.current_dir(dir);
        }

        let output = cmd
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AppError::ComposeError(format!("Failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            return Err(AppError::ComposeError(format!(
                "compose {} failed for {} ({}): {}",
                args.first().copied().unwrap_or_default(),
                target.stack_name,
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Last few lines of a subprocess's stderr
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}

#[async_trait]
impl ComposeDriver for ComposeCli {
    async fn up(&self, target: &ComposeTarget) -> Result<(), AppError> {
        self.compose(target, &["up", "--detach", "--remove-orphans"])
            .await
            .map(|_| ())
    }

    async fn down(&self, target: &ComposeTarget, remove_volumes: bool) -> Result<(), AppError> {
        let mut args = vec!["down", "--remove-orphans"];
        if remove_volumes {
            args.push("--volumes");
        }
        self.compose(target, &args).await.map(|_| ())
    }

    async fn start(&self, target: &ComposeTarget) -> Result<(), AppError> {
        self.compose(target, &["start"]).await.map(|_| ())
    }

    async fn stop(&self, target: &ComposeTarget) -> Result<(), AppError> {
        self.compose(target, &["stop"]).await.map(|_| ())
    }

    async fn restart(&self, target: &ComposeTarget) -> Result<(), AppError> {
        self.compose(target, &["restart"]).await.map(|_| ())
    }

    async fn extract_images(&self, target: &ComposeTarget) -> Result<Vec<String>, AppError> {
        let output = self.compose(target, &["config", "--images"]).await?;
        Ok(parse_image_list(&output))
    }

    async fn get_runtime_info(&self, target: &ComposeTarget) -> Result<RuntimeInfo, AppError> {
        let output = self
            .compose(target, &["ps", "--all", "--format", "json"])
            .await?;
        parse_ps_output(&output)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), AppError> {
        let output = Command::new(&self.docker_command)
            .args(["volume", "rm", name])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AppError::ComposeError(format!("Failed to run {}: {}", self.docker_command, e)))?;

        if !output.status.success() {
            return Err(AppError::ComposeError(format!(
                "docker volume rm {} failed: {}",
                name,
                stderr_tail(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Unique image references, in order of first appearance
pub fn parse_image_list(output: &str) -> Vec<String> {
    let mut images: Vec<String> = Vec::new();
    for image in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !images.iter().any(|i| i == image) {
            images.push(image.to_string());
        }
    }
    images
}

/// Parse `compose ps --format json`, which is either one JSON array or one object per line
pub fn parse_ps_output(output: &str) -> Result<RuntimeInfo, AppError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(RuntimeInfo::default());
    }

    let containers = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<ContainerState>>(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str::<ContainerState>)
            .collect::<Result<Vec<_>, _>>()?
    };

    Ok(RuntimeInfo { containers })
}
