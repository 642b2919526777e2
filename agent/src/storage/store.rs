//! Persistence of operations, installed stacks and update state

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::AppError;
use crate::filesys::file::File;
use crate::models::operation::{OperationPatch, StoreOperation};
use crate::models::stack::{AppUpdateState, InstalledStackConfig};

/// Persistence collaborator of the orchestrator
#[async_trait]
pub trait StackStore: Send + Sync {
    async fn create_operation(&self, operation: &StoreOperation) -> Result<(), AppError>;

    /// Apply `patch` to a stored operation and return the updated record
    async fn update_operation(
        &self,
        id: &str,
        patch: &OperationPatch,
    ) -> Result<StoreOperation, AppError>;

    async fn find_operation_by_id(&self, id: &str) -> Result<Option<StoreOperation>, AppError>;

    async fn find_installed_stack(
        &self,
        app_id: &str,
    ) -> Result<Option<InstalledStackConfig>, AppError>;

    /// Every record whose status is `installed`
    async fn list_installed_stacks(&self) -> Result<Vec<InstalledStackConfig>, AppError>;

    /// Installed stack publishing `port`, ignoring `exclude_app_id`
    async fn find_stack_by_web_ui_port(
        &self,
        port: u16,
        exclude_app_id: Option<&str>,
    ) -> Result<Option<InstalledStackConfig>, AppError>;

    async fn upsert_installed_stack(&self, stack: &InstalledStackConfig) -> Result<(), AppError>;

    /// Delete the installed-stack record, returning whether one existed
    async fn delete_installed_stack(&self, app_id: &str) -> Result<bool, AppError>;

    async fn upsert_update_state(&self, state: &AppUpdateState) -> Result<(), AppError>;

    async fn find_update_state(&self, app_id: &str) -> Result<Option<AppUpdateState>, AppError>;
}

/// Everything the JSON store keeps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    #[serde(default)]
    pub operations: HashMap<String, StoreOperation>,

    #[serde(default)]
    pub installed_stacks: HashMap<String, InstalledStackConfig>,

    #[serde(default)]
    pub update_states: HashMap<String, AppUpdateState>,
}

/// Store keeping every record in memory and mirroring it to one JSON file
pub struct JsonStackStore {
    file: Option<File>,
    snapshot: Mutex<StoreSnapshot>,
}

impl JsonStackStore {
    /// Open (or start) a store backed by `file`
    pub async fn open(file: File) -> Result<Self, AppError> {
        let snapshot = if file.exists().await {
            file.read_json::<StoreSnapshot>()
                .await
                .map_err(|e| AppError::PersistenceError(format!("Unable to read {}: {}", file.path().display(), e)))?
        } else {
            StoreSnapshot::default()
        };

        debug!(
            "Loaded {} operations and {} installed stacks from {}",
            snapshot.operations.len(),
            snapshot.installed_stacks.len(),
            file.path().display()
        );

        Ok(Self {
            file: Some(file),
            snapshot: Mutex::new(snapshot),
        })
    }

    /// Store without a backing file
    pub fn in_memory() -> Self {
        Self {
            file: None,
            snapshot: Mutex::new(StoreSnapshot::default()),
        }
    }

    async fn flush(&self, snapshot: &StoreSnapshot) -> Result<(), AppError> {
        if let Some(file) = &self.file {
            file.write_json(snapshot)
                .await
                .map_err(|e| AppError::PersistenceError(format!("Unable to write {}: {}", file.path().display(), e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StackStore for JsonStackStore {
    async fn create_operation(&self, operation: &StoreOperation) -> Result<(), AppError> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.operations.contains_key(&operation.id) {
            return Err(AppError::PersistenceError(format!(
                "Operation {} already exists",
                operation.id
            )));
        }
        snapshot
            .operations
            .insert(operation.id.clone(), operation.clone());
        self.flush(&snapshot).await
    }

    async fn update_operation(
        &self,
        id: &str,
        patch: &OperationPatch,
    ) -> Result<StoreOperation, AppError> {
        let mut snapshot = self.snapshot.lock().await;
        let operation = snapshot
            .operations
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("Operation {}", id)))?;
        operation.apply(patch)?;
        let updated = operation.clone();
        self.flush(&snapshot).await?;
        Ok(updated)
    }

    async fn find_operation_by_id(&self, id: &str) -> Result<Option<StoreOperation>, AppError> {
        Ok(self.snapshot.lock().await.operations.get(id).cloned())
    }

    async fn find_installed_stack(
        &self,
        app_id: &str,
    ) -> Result<Option<InstalledStackConfig>, AppError> {
        Ok(self.snapshot.lock().await.installed_stacks.get(app_id).cloned())
    }

    async fn list_installed_stacks(&self) -> Result<Vec<InstalledStackConfig>, AppError> {
        let snapshot = self.snapshot.lock().await;
        Ok(snapshot
            .installed_stacks
            .values()
            .filter(|stack| stack.is_installed())
            .cloned()
            .collect())
    }

    async fn find_stack_by_web_ui_port(
        &self,
        port: u16,
        exclude_app_id: Option<&str>,
    ) -> Result<Option<InstalledStackConfig>, AppError> {
        let snapshot = self.snapshot.lock().await;
        Ok(snapshot
            .installed_stacks
            .values()
            .filter(|stack| stack.is_installed())
            .filter(|stack| Some(stack.app_id.as_str()) != exclude_app_id)
            .find(|stack| stack.web_ui_port == Some(port))
            .cloned())
    }

    async fn upsert_installed_stack(&self, stack: &InstalledStackConfig) -> Result<(), AppError> {
        let mut snapshot = self.snapshot.lock().await;
        snapshot
            .installed_stacks
            .insert(stack.app_id.clone(), stack.clone());
        self.flush(&snapshot).await
    }

    async fn delete_installed_stack(&self, app_id: &str) -> Result<bool, AppError> {
        let mut snapshot = self.snapshot.lock().await;
        let existed = snapshot.installed_stacks.remove(app_id).is_some();
        snapshot.update_states.remove(app_id);
        self.flush(&snapshot).await?;
        Ok(existed)
    }

    async fn upsert_update_state(&self, state: &AppUpdateState) -> Result<(), AppError> {
        let mut snapshot = self.snapshot.lock().await;
        snapshot
            .update_states
            .insert(state.app_id.clone(), state.clone());
        self.flush(&snapshot).await
    }

    async fn find_update_state(&self, app_id: &str) -> Result<Option<AppUpdateState>, AppError> {
        Ok(self.snapshot.lock().await.update_states.get(app_id).cloned())
    }
}
