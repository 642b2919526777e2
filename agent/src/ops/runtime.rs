//! Start, stop, restart and update checks of installed apps

use chrono::Utc;
use tracing::warn;

use crate::deploy::compose::ComposeTarget;
use crate::errors::AppError;
use crate::models::operation::OperationAction;
use crate::models::stack::{AppUpdateState, InstalledStackConfig};
use crate::ops::OperationRun;

async fn require_installed(run: &OperationRun) -> Result<InstalledStackConfig, AppError> {
    run.installed_stack()
        .await?
        .ok_or_else(|| AppError::ValidationError(format!("{} is not installed", run.app_id())))
}

pub(crate) async fn runtime_action(run: &mut OperationRun, action: OperationAction) -> Result<String, AppError> {
    let stack = require_installed(run).await?;
    let target = ComposeTarget::from(&stack);
    let deps = run.deps().clone();

    let (label, done) = match action {
        OperationAction::Start => ("Starting containers", "Started"),
        OperationAction::Stop => ("Stopping containers", "Stopped"),
        OperationAction::Restart => ("Restarting containers", "Restarted"),
        other => {
            return Err(AppError::Internal(format!(
                "{} is not a runtime action",
                other
            )))
        }
    };

    run.step(40, label).await;
    match action {
        OperationAction::Start => deps.compose.start(&target).await?,
        OperationAction::Stop => deps.compose.stop(&target).await?,
        _ => deps.compose.restart(&target).await?,
    }

    run.step(85, "Refreshing status").await;
    match deps.compose.get_runtime_info(&target).await {
        Ok(info) => Ok(format!(
            "{} {} ({}/{} containers running)",
            done,
            stack.app_id,
            info.running_count(),
            info.containers.len()
        )),
        Err(e) => {
            warn!("Unable to read runtime status of {}: {}", stack.app_id, e);
            Ok(format!("{} {}", done, stack.app_id))
        }
    }
}

pub(crate) async fn check_updates(run: &mut OperationRun) -> Result<String, AppError> {
    let stack = require_installed(run).await?;
    let target = ComposeTarget::from(&stack);
    let deps = run.deps().clone();

    run.step(40, "Checking for image updates").await;
    let resolution = deps.updates.resolve_update_state(&target).await?;

    run.step(85, "Saving update state").await;
    deps.store
        .upsert_update_state(&AppUpdateState {
            app_id: stack.app_id.clone(),
            update_available: resolution.update_available,
            local_digest: resolution.local_digest,
            remote_digest: resolution.remote_digest,
            checked_at: Utc::now(),
        })
        .await?;

    if resolution.update_available {
        Ok(format!("Update available for {}", stack.app_id))
    } else {
        Ok(format!("{} is up to date", stack.app_id))
    }
}
