//! Uninstall
//!
//! Cleanup after `compose down` is best effort: failures are collected,
//! logged and reported in the final message instead of failing the
//! operation.

use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};

use crate::deploy::compose::ComposeTarget;
use crate::deploy::rewriter::{classify_source, service_volume_entries, top_level_volume_names, VolumeSource};
use crate::errors::AppError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::operation::UninstallParams;
use crate::ops::OperationRun;

/// Best-effort failures of one uninstall
#[derive(Debug, Default)]
struct CleanupReport {
    warnings: Vec<String>,
}

impl CleanupReport {
    fn warn(&mut self, app_id: &str, message: String) {
        warn!("Uninstall of {}: {}", app_id, message);
        self.warnings.push(message);
    }
}

/// Whether `path` lies strictly below `root` without any `..` segment
fn is_strictly_inside(path: &Path, root: &Path) -> bool {
    path != root
        && path.starts_with(root)
        && path
            .components()
            .all(|c| !matches!(c, Component::ParentDir | Component::CurDir))
}

/// Host directories of the stack's bind mounts that live under `app_data_root`
fn data_dirs(compose: &str, app_id: &str, app_data_root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = service_volume_entries(compose)
        .into_iter()
        .filter(|entry| classify_source(&entry.source) == VolumeSource::Bind)
        .map(|entry| PathBuf::from(entry.source))
        .filter(|path| is_strictly_inside(path, app_data_root))
        .collect();

    let app_root = app_data_root.join(app_id);
    dirs.retain(|dir| !dir.starts_with(&app_root));
    dirs.push(app_root);
    dirs.sort();
    dirs.dedup();
    dirs
}

/// Bind sources under the app data root mounted by the other installed apps
async fn foreign_mounts(run: &OperationRun, report: &mut CleanupReport) -> Result<Vec<(String, PathBuf)>, AppError> {
    let app_data_root = run.deps().materializer.app_data_root().to_path_buf();
    let mut mounts = Vec::new();

    for other in run.deps().store.list_installed_stacks().await? {
        if other.app_id == run.app_id() {
            continue;
        }
        let content = match File::new(other.compose_path.clone()).read_string().await {
            Ok(content) => content,
            Err(e) => {
                report.warn(
                    run.app_id(),
                    format!("unable to read compose file of {}: {}", other.app_id, e),
                );
                continue;
            }
        };
        mounts.extend(
            service_volume_entries(&content)
                .into_iter()
                .filter(|entry| classify_source(&entry.source) == VolumeSource::Bind)
                .map(|entry| PathBuf::from(entry.source))
                .filter(|path| path.starts_with(&app_data_root))
                .map(|path| (other.app_id.clone(), path)),
        );
    }
    Ok(mounts)
}

pub(crate) async fn uninstall(run: &mut OperationRun, options: UninstallParams) -> Result<String, AppError> {
    let app_id = run.app_id().to_string();
    let deps = run.deps().clone();

    let Some(stack) = run.installed_stack().await? else {
        // Nothing deployed; still drop whatever record is lying around
        deps.store.delete_installed_stack(&app_id).await?;
        info!("{} is not installed, nothing to uninstall", app_id);
        return Ok(format!("{} is not installed", app_id));
    };

    let target = ComposeTarget::from(&stack);
    let mut report = CleanupReport::default();

    let compose_file = File::new(stack.compose_path.clone());
    let compose = if compose_file.exists().await {
        match compose_file.read_string().await {
            Ok(content) => Some(content),
            Err(e) => {
                report.warn(&app_id, format!("unable to read {}: {}", stack.compose_path.display(), e));
                None
            }
        }
    } else {
        None
    };

    run.step(35, "Stopping and removing containers").await;
    if compose.is_some() {
        deps.compose.down(&target, options.remove_volumes).await?;
    } else {
        report.warn(
            &app_id,
            format!("compose file {} is missing, skipped compose down", stack.compose_path.display()),
        );
    }

    if options.remove_data {
        run.step(70, "Removing app data").await;
        let app_data_root = deps.materializer.app_data_root().to_path_buf();
        let shared = foreign_mounts(run, &mut report).await?;
        for dir in data_dirs(compose.as_deref().unwrap_or_default(), &app_id, &app_data_root) {
            if let Some((owner, _)) = shared
                .iter()
                .find(|(_, source)| source.starts_with(&dir) || dir.starts_with(source))
            {
                report.warn(&app_id, format!("kept {}, still mounted by {}", dir.display(), owner));
                continue;
            }
            if let Err(e) = Dir::new(dir.clone()).delete().await {
                report.warn(&app_id, format!("unable to remove {}: {}", dir.display(), e));
            }
        }
    }

    if options.remove_volumes {
        run.step(90, "Removing volumes").await;
        for name in compose.as_deref().map(top_level_volume_names).unwrap_or_default() {
            let volume = format!("{}_{}", stack.stack_name, name);
            // `down --volumes` usually removed it already
            if let Err(e) = deps.compose.remove_volume(&volume).await {
                warn!("Volume {} not removed: {}", volume, e);
            }
        }
    }

    run.step(95, "Removing stack files").await;
    if let Some(stack_dir) = stack.compose_path.parent() {
        if let Err(e) = Dir::new(stack_dir).delete().await {
            report.warn(&app_id, format!("unable to remove {}: {}", stack_dir.display(), e));
        }
    }
    deps.store.delete_installed_stack(&app_id).await?;

    if report.warnings.is_empty() {
        Ok(format!("Uninstalled {}", app_id))
    } else {
        Ok(format!(
            "Uninstalled {} with {} cleanup warning(s): {}",
            app_id,
            report.warnings.len(),
            report.warnings.join("; ")
        ))
    }
}
