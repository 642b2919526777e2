//! Install and redeploy

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::deploy::compose::ComposeTarget;
use crate::deploy::materializer::{ComposeSource, MaterializeRequest};
use crate::deploy::pull::pull_all;
use crate::errors::AppError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::operation::DeployParams;
use crate::models::stack::{
    AppUpdateState, InstalledStackConfig, InstalledStackStatus, MaterializedStack,
};
use crate::models::template::AppTemplate;
use crate::ops::resolve::{
    choose_strategy, ensure_port_available, find_template, merge_env_permissive,
    merge_env_whitelisted, parse_compose, primary_service, resolve_port, service_environment,
    service_published_port,
};
use crate::ops::OperationRun;
use crate::utils::sanitize_stack_name;

/// Where the compose text of a deployment comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceOrigin {
    /// Supplied with the request
    Request,
    /// Compose file of the current install
    Installed,
    /// Hosted by (or embedded in) the template
    Template,
}

async fn select_source(
    params: &DeployParams,
    existing: Option<&InstalledStackConfig>,
    template: &AppTemplate,
) -> Result<(ComposeSource, SourceOrigin), AppError> {
    if let Some(content) = params
        .compose_source
        .as_ref()
        .filter(|c| !c.trim().is_empty())
    {
        return Ok((ComposeSource::Inline(content.clone()), SourceOrigin::Request));
    }

    if let Some(stack) = existing {
        let file = File::new(stack.compose_path.clone());
        if file.exists().await {
            return Ok((
                ComposeSource::Inline(file.read_string().await?),
                SourceOrigin::Installed,
            ));
        }
        warn!(
            "Compose file {} of {} is missing, falling back to the template",
            stack.compose_path.display(),
            stack.app_id
        );
    }

    if let (Some(repository_url), Some(stack_file)) = (&template.repository_url, &template.stack_file) {
        return Ok((
            ComposeSource::Template {
                repository_url: repository_url.clone(),
                stack_file: stack_file.clone(),
            },
            SourceOrigin::Template,
        ));
    }
    if let Some(content) = &template.compose_content {
        return Ok((ComposeSource::Inline(content.clone()), SourceOrigin::Template));
    }

    Err(AppError::ValidationError(format!(
        "Template {} has neither a stack file nor compose content",
        template.template_name
    )))
}

/// Install (or reinstall) and redeploy an app
pub(crate) async fn deploy(
    run: &mut OperationRun,
    params: DeployParams,
    redeploy: bool,
) -> Result<String, AppError> {
    let app_id = run.app_id().to_string();
    let deps = run.deps().clone();

    let template = find_template(deps.catalog.as_ref(), &app_id).await?;
    let existing = run.installed_stack().await?;
    if redeploy && existing.is_none() {
        return Err(AppError::ValidationError(format!("{} is not installed", app_id)));
    }

    let stack_name = existing
        .as_ref()
        .map(|s| s.stack_name.clone())
        .unwrap_or_else(|| sanitize_stack_name(&app_id));

    let (source, origin) = select_source(&params, existing.as_ref(), &template).await?;

    // Environment and port inference
    let existing_env = existing.as_ref().map(|s| &s.env);
    let (env, inferred_port) = match (&source, origin) {
        (ComposeSource::Inline(content), SourceOrigin::Request | SourceOrigin::Installed) => {
            let compose = parse_compose(content)?;
            let service = primary_service(&compose, &template, &app_id, &stack_name);
            debug!(
                "Primary service of {} is {:?}",
                app_id,
                service.map(|(name, _)| name)
            );
            let declared = service.map(|(_, s)| service_environment(s)).unwrap_or_default();
            let env = merge_env_permissive(&template, &declared, existing_env, &params.env);
            let port = service
                .and_then(|(_, s)| service_published_port(s))
                .or(template.web_ui_port);
            (env, port)
        }
        _ => (
            merge_env_whitelisted(&template, existing_env, &params.env)?,
            template.web_ui_port,
        ),
    };

    let port = resolve_port(
        params.web_ui_port,
        existing.as_ref().and_then(|s| s.web_ui_port),
        inferred_port,
    )?;
    if let Some(port) = port {
        ensure_port_available(deps.store.as_ref(), port.port, &app_id).await?;
    }

    let strategy = choose_strategy(existing.as_ref(), redeploy);
    let fresh_install = existing.is_none();

    run.step(8, "Rendering compose files").await;
    let stack = deps
        .materializer
        .materialize(&MaterializeRequest {
            app_id: app_id.clone(),
            stack_name: stack_name.clone(),
            source,
            env: env.clone(),
            web_ui_port_override: port.filter(|p| p.needs_override()).map(|p| p.port),
            web_ui_port: port.map(|p| p.port),
            strategy,
        })
        .await?;
    let target = ComposeTarget::from(&stack);

    let mut up_attempted = false;
    let result = bring_up(run, &target, &mut up_attempted).await;
    if let Err(e) = result {
        if fresh_install {
            rollback(run, &stack, &target, up_attempted).await;
        }
        return Err(e);
    }

    run.step(95, "Finalizing").await;
    let now = Utc::now();
    let record = InstalledStackConfig {
        app_id: app_id.clone(),
        template_name: template.template_name.clone(),
        stack_name: stack.stack_name.clone(),
        compose_path: stack.compose_path.clone(),
        status: InstalledStackStatus::Installed,
        web_ui_port: stack.web_ui_port,
        env,
        installed_at: existing.as_ref().map(|s| s.installed_at).unwrap_or(now),
        updated_at: now,
    };
    deps.store.upsert_installed_stack(&record).await?;
    deps.store
        .upsert_update_state(&AppUpdateState::up_to_date(&app_id))
        .await?;

    let verb = if redeploy { "Redeployed" } else { "Installed" };
    let summary = match deps.compose.get_runtime_info(&target).await {
        Ok(info) => format!(
            "{} {} ({}/{} containers running)",
            verb,
            app_id,
            info.running_count(),
            info.containers.len()
        ),
        Err(e) => {
            warn!("Unable to read runtime status of {}: {}", app_id, e);
            format!("{} {}", verb, app_id)
        }
    };
    info!("{} with storage mapping {}", summary, strategy);
    Ok(summary)
}

/// Pull every image of the rendered stack, then start it
async fn bring_up(
    run: &mut OperationRun,
    target: &ComposeTarget,
    up_attempted: &mut bool,
) -> Result<(), AppError> {
    let deps = run.deps().clone();

    run.step(15, "Pulling images").await;
    let images = deps.compose.extract_images(target).await?;
    debug!("Stack {} references images {:?}", target.stack_name, images);
    pull_all(deps.puller.as_ref(), &images, run).await?;

    run.step(85, "Starting containers").await;
    *up_attempted = true;
    deps.compose.up(target).await
}

/// Undo a failed first install so no half-written stack is left behind
async fn rollback(
    run: &mut OperationRun,
    stack: &MaterializedStack,
    target: &ComposeTarget,
    up_attempted: bool,
) {
    let deps = run.deps().clone();
    warn!("Rolling back failed install of {}", run.app_id());

    if up_attempted {
        if let Err(e) = deps.compose.down(target, false).await {
            warn!("Rollback of {}: compose down failed: {}", run.app_id(), e);
        }
    }
    if let Err(e) = Dir::new(stack.stack_dir.clone()).delete().await {
        warn!(
            "Rollback of {}: unable to remove {}: {}",
            run.app_id(),
            stack.stack_dir.display(),
            e
        );
    }
}
