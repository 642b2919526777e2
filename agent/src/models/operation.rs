//! Lifecycle operations and their broadcast events

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::deploy::fsm::OperationStatus;
use crate::deploy::fsm;
use crate::errors::AppError;
use crate::utils::generate_uuid;

/// Lifecycle action an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationAction {
    Install,
    Redeploy,
    Uninstall,
    Start,
    Stop,
    Restart,
    CheckUpdates,
}

impl OperationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationAction::Install => "install",
            OperationAction::Redeploy => "redeploy",
            OperationAction::Uninstall => "uninstall",
            OperationAction::Start => "start",
            OperationAction::Stop => "stop",
            OperationAction::Restart => "restart",
            OperationAction::CheckUpdates => "check-updates",
        }
    }
}

impl fmt::Display for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(OperationAction::Install),
            "redeploy" => Ok(OperationAction::Redeploy),
            "uninstall" => Ok(OperationAction::Uninstall),
            "start" => Ok(OperationAction::Start),
            "stop" => Ok(OperationAction::Stop),
            "restart" => Ok(OperationAction::Restart),
            "check-updates" | "check_updates" => Ok(OperationAction::CheckUpdates),
            _ => Err(AppError::ValidationError(format!("Unknown action: {}", s))),
        }
    }
}

/// Parameters of an install or redeploy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployParams {
    /// Requested published web UI port, range-checked when the operation runs
    pub web_ui_port: Option<i64>,

    /// Requested environment overrides
    pub env: BTreeMap<String, String>,

    /// User-supplied compose definition replacing the template's
    pub compose_source: Option<String>,
}

/// Parameters of an uninstall
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UninstallParams {
    /// Pass `--volumes` to compose down and drop leftover named volumes
    pub remove_volumes: bool,

    /// Delete bind-mounted data directories under the app data root
    pub remove_data: bool,
}

/// Action-specific request accepted by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationParams {
    Install(DeployParams),
    Redeploy(DeployParams),
    Uninstall(UninstallParams),
    Start,
    Stop,
    Restart,
    CheckUpdates,
}

impl OperationParams {
    pub fn action(&self) -> OperationAction {
        match self {
            OperationParams::Install(_) => OperationAction::Install,
            OperationParams::Redeploy(_) => OperationAction::Redeploy,
            OperationParams::Uninstall(_) => OperationAction::Uninstall,
            OperationParams::Start => OperationAction::Start,
            OperationParams::Stop => OperationAction::Stop,
            OperationParams::Restart => OperationAction::Restart,
            OperationParams::CheckUpdates => OperationAction::CheckUpdates,
        }
    }

    /// Build params for `action` from an optional JSON body
    pub fn from_json(action: OperationAction, body: serde_json::Value) -> Result<Self, AppError> {
        let body = if body.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            body
        };

        let params = match action {
            OperationAction::Install => OperationParams::Install(
                serde_json::from_value(body).map_err(|e| AppError::ValidationError(e.to_string()))?,
            ),
            OperationAction::Redeploy => OperationParams::Redeploy(
                serde_json::from_value(body).map_err(|e| AppError::ValidationError(e.to_string()))?,
            ),
            OperationAction::Uninstall => OperationParams::Uninstall(
                serde_json::from_value(body).map_err(|e| AppError::ValidationError(e.to_string()))?,
            ),
            OperationAction::Start => OperationParams::Start,
            OperationAction::Stop => OperationParams::Stop,
            OperationAction::Restart => OperationParams::Restart,
            OperationAction::CheckUpdates => OperationParams::CheckUpdates,
        };
        Ok(params)
    }
}

/// Persisted record of one lifecycle action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOperation {
    pub id: String,
    pub app_id: String,
    pub action: OperationAction,
    pub status: OperationStatus,
    pub progress_percent: u8,
    pub current_step: String,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of a [`StoreOperation`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationPatch {
    pub status: Option<OperationStatus>,
    pub progress_percent: Option<u8>,
    pub current_step: Option<String>,
    pub error_message: Option<String>,
}

impl StoreOperation {
    /// Create a queued operation with a fresh id
    pub fn queued(app_id: &str, action: OperationAction) -> Self {
        let now = Utc::now();
        Self {
            id: generate_uuid(),
            app_id: app_id.to_string(),
            action,
            status: OperationStatus::Queued,
            progress_percent: 0,
            current_step: "Queued".to_string(),
            error_message: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a patch.
    ///
    /// Progress never goes backwards, stays below 100 while the operation is
    /// not terminal and is forced to 100 once it is. `started_at` and
    /// `finished_at` are only ever set once.
    pub fn apply(&mut self, patch: &OperationPatch) -> Result<(), AppError> {
        let now = Utc::now();

        if let Some(status) = patch.status {
            self.status = fsm::transition(self.status, status).map_err(AppError::Internal)?;
        }

        if let Some(requested) = patch.progress_percent {
            self.progress_percent = self.progress_percent.max(requested.min(100));
        }
        if self.status.is_terminal() {
            self.progress_percent = 100;
        } else {
            self.progress_percent = self.progress_percent.min(99);
        }

        if let Some(step) = &patch.current_step {
            self.current_step = step.clone();
        }
        if let Some(message) = &patch.error_message {
            self.error_message = Some(message.clone());
        }

        if self.status != OperationStatus::Queued && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if self.status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Kind of a broadcast operation event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationEventType {
    #[serde(rename = "operation.started")]
    Started,
    #[serde(rename = "operation.step")]
    Step,
    #[serde(rename = "operation.pull.progress")]
    PullProgress,
    #[serde(rename = "operation.completed")]
    Completed,
    #[serde(rename = "operation.failed")]
    Failed,
}

impl OperationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationEventType::Started => "operation.started",
            OperationEventType::Step => "operation.step",
            OperationEventType::PullProgress => "operation.pull.progress",
            OperationEventType::Completed => "operation.completed",
            OperationEventType::Failed => "operation.failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationEventType::Completed | OperationEventType::Failed)
    }
}

/// Byte progress of one image pull
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

/// Ephemeral event broadcast to operation listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOperationEvent {
    #[serde(rename = "type")]
    pub event_type: OperationEventType,
    pub operation_id: String,
    pub app_id: String,
    pub action: OperationAction,
    pub status: OperationStatus,
    pub progress_percent: u8,
    pub step: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_detail: Option<ProgressDetail>,

    pub timestamp: DateTime<Utc>,
}

impl StoreOperationEvent {
    /// Snapshot an operation into an event of the given type
    pub fn from_operation(event_type: OperationEventType, operation: &StoreOperation) -> Self {
        Self {
            event_type,
            operation_id: operation.id.clone(),
            app_id: operation.app_id.clone(),
            action: operation.action,
            status: operation.status,
            progress_percent: operation.progress_percent.min(100),
            step: operation.current_step.clone(),
            message: None,
            image: None,
            docker_status: None,
            progress_detail: None,
            timestamp: Utc::now(),
        }
    }
}
