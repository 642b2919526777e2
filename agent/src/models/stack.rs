//! Installed stacks and materialization results

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a stack record describes a deployed app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstalledStackStatus {
    Installed,
    NotInstalled,
}

/// Durable record of a deployed application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledStackConfig {
    pub app_id: String,
    pub template_name: String,
    pub stack_name: String,
    pub compose_path: PathBuf,
    pub status: InstalledStackStatus,
    pub web_ui_port: Option<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstalledStackConfig {
    /// Whether the record still describes a deployed app
    pub fn is_installed(&self) -> bool {
        self.status == InstalledStackStatus::Installed
    }

    /// The `.env` file written next to the compose file
    pub fn env_path(&self) -> PathBuf {
        self.compose_path
            .parent()
            .map(|dir| dir.join(".env"))
            .unwrap_or_else(|| PathBuf::from(".env"))
    }
}

/// Output of the materializer, consumed right away by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedStack {
    pub stack_dir: PathBuf,
    pub compose_path: PathBuf,
    pub env_path: PathBuf,
    pub stack_name: String,
    pub web_ui_port: Option<u16>,
}

/// How named-volume references are turned into host bind mounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMappingStrategy {
    /// `<appDataRoot>/<appId>/<container target>`
    AppTargetPath,
    /// `<appDataRoot>/<volume name>`, the layout of stacks deployed before per-app scoping
    LegacyNamedSource,
}

impl fmt::Display for StorageMappingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMappingStrategy::AppTargetPath => write!(f, "app_target_path"),
            StorageMappingStrategy::LegacyNamedSource => write!(f, "legacy_named_source"),
        }
    }
}

/// Image freshness of an installed app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppUpdateState {
    pub app_id: String,
    pub update_available: bool,
    pub local_digest: Option<String>,
    pub remote_digest: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl AppUpdateState {
    /// State asserted right after a successful install or redeploy
    pub fn up_to_date(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            update_available: false,
            local_digest: None,
            remote_digest: None,
            checked_at: Utc::now(),
        }
    }
}

/// One container of a running stack, as reported by `compose ps`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "Service", default)]
    pub service: String,

    #[serde(rename = "State", default)]
    pub state: String,

    #[serde(rename = "Status", default)]
    pub status: String,
}

/// Runtime view of a stack
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub containers: Vec<ContainerState>,
}

impl RuntimeInfo {
    pub fn running_count(&self) -> usize {
        self.containers
            .iter()
            .filter(|c| c.state.eq_ignore_ascii_case("running"))
            .count()
    }
}
