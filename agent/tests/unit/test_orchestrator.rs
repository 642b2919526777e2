//! Operation orchestrator tests

mod common;

use std::collections::BTreeMap;

use chrono::Utc;

use common::{Harness, IMMICH_INLINE_COMPOSE};
use stackd::deploy::docker::UpdateResolution;
use stackd::errors::AppError;
use stackd::models::operation::{
    DeployParams, OperationEventType, OperationParams, OperationStatus, StoreOperationEvent,
    UninstallParams,
};
use stackd::models::stack::{InstalledStackConfig, InstalledStackStatus, StorageMappingStrategy};
use stackd::storage::store::StackStore;

fn deploy(port: Option<i64>, env: &[(&str, &str)]) -> DeployParams {
    DeployParams {
        web_ui_port: port,
        env: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        compose_source: None,
    }
}

fn install(port: Option<i64>, env: &[(&str, &str)]) -> OperationParams {
    OperationParams::Install(deploy(port, env))
}

#[tokio::test]
async fn test_install_with_requested_port() {
    let h = Harness::new();
    let mut invalidations = h.cache.subscribe();

    let op = h
        .run("adguard-home", install(Some(3001), &[("TZ", "Africa/Tunis")]))
        .await;
    assert_eq!(op.status, OperationStatus::Success, "{:?}", op.error_message);
    assert_eq!(op.progress_percent, 100);
    assert!(op.finished_at.is_some());

    let stack = h.store.find_installed_stack("adguard-home").await.unwrap().unwrap();
    assert_eq!(stack.status, InstalledStackStatus::Installed);
    assert_eq!(stack.web_ui_port, Some(3001));
    assert_eq!(stack.env.get("TZ").map(String::as_str), Some("Africa/Tunis"));

    let requests = h.materializer.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].strategy, StorageMappingStrategy::AppTargetPath);
    assert!(!requests[0].source.is_inline());

    let compose = std::fs::read_to_string(&stack.compose_path).unwrap();
    assert!(compose.contains("\"3001:3000\""));
    assert!(compose.contains("\"53:53/udp\""));
    assert!(h.data.path().join("adguard-home/opt/adguardhome/work").is_dir());

    assert_eq!(h.compose.calls(), vec!["up adguard-home"]);
    assert_eq!(
        *h.puller.pulled.lock().unwrap(),
        vec!["adguard/adguardhome:v0.107.52"]
    );

    let latest = h.orchestrator.get_latest_event(&op.id).unwrap();
    assert_eq!(latest.event_type, OperationEventType::Completed);
    assert_eq!(latest.progress_percent, 100);
    assert_eq!(
        latest.message.as_deref(),
        Some("Installed adguard-home (1/1 containers running)")
    );

    assert_eq!(invalidations.try_recv().unwrap(), "adguard-home");

    let update = h.store.find_update_state("adguard-home").await.unwrap().unwrap();
    assert!(!update.update_available);
}

#[tokio::test]
async fn test_pull_failure_fails_and_rolls_back() {
    let h = Harness::new();
    h.puller.fail("ghcr.io/gethomepage/homepage:latest");

    let op = h.run("homepage", install(None, &[])).await;
    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(op.progress_percent, 100);
    assert!(op
        .error_message
        .as_deref()
        .unwrap()
        .contains("pull access denied"));

    let latest = h.orchestrator.get_latest_event(&op.id).unwrap();
    assert_eq!(latest.event_type, OperationEventType::Failed);
    assert_eq!(latest.status, OperationStatus::Error);

    // Nothing was started and nothing is left behind
    assert!(h.compose.calls().is_empty());
    assert!(h.store.find_installed_stack("homepage").await.unwrap().is_none());
    assert!(!h.stacks.path().join("homepage").exists());
}

#[tokio::test]
async fn test_failed_up_is_torn_down() {
    let h = Harness::new();
    *h.compose.fail_up.lock().unwrap() = true;

    let op = h.run("homepage", install(None, &[])).await;
    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(h.compose.calls(), vec!["up homepage", "down homepage"]);
    assert!(!h.stacks.path().join("homepage").exists());
}

#[tokio::test]
async fn test_inline_compose_keeps_undeclared_env() {
    let h = Harness::new();
    let mut params = deploy(None, &[("EXTRA", "1")]);
    params.compose_source = Some(IMMICH_INLINE_COMPOSE.to_string());

    let op = h.run("immich", OperationParams::Install(params)).await;
    assert_eq!(op.status, OperationStatus::Success, "{:?}", op.error_message);

    let requests = h.materializer.requests();
    assert!(requests[0].source.is_inline());
    let env = &requests[0].env;
    assert_eq!(env.get("DB_HOSTNAME").map(String::as_str), Some("immich-postgres"));
    assert_eq!(env.get("CUSTOM_ENV").map(String::as_str), Some("yes"));
    assert_eq!(env.get("EXTRA").map(String::as_str), Some("1"));
    assert_eq!(env.get("TZ").map(String::as_str), Some("UTC"));

    // Port inferred from the primary service, so the compose file keeps it
    assert_eq!(requests[0].web_ui_port_override, None);
    let stack = h.store.find_installed_stack("immich").await.unwrap().unwrap();
    assert_eq!(stack.web_ui_port, Some(2283));
    assert_eq!(h.puller.pulled.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_env_key_rejected_for_template_source() {
    let h = Harness::new();
    let op = h
        .run("adguard-home", install(None, &[("DB_HOSTNAME", "db")]))
        .await;
    assert_eq!(op.status, OperationStatus::Error);
    assert!(op.error_message.unwrap().contains("DB_HOSTNAME"));
    assert!(h.materializer.requests().is_empty());
    assert!(h.compose.calls().is_empty());
}

#[tokio::test]
async fn test_redeploy_keeps_legacy_layout() {
    let h = Harness::new();
    let first = h
        .run("adguard-home", install(Some(3001), &[("TZ", "Africa/Tunis")]))
        .await;
    assert_eq!(first.status, OperationStatus::Success);
    let installed = h.store.find_installed_stack("adguard-home").await.unwrap().unwrap();

    let op = h
        .run("adguard-home", OperationParams::Redeploy(deploy(Some(3001), &[])))
        .await;
    assert_eq!(op.status, OperationStatus::Success, "{:?}", op.error_message);

    let requests = h.materializer.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].strategy, StorageMappingStrategy::LegacyNamedSource);
    // The previously installed compose file is the source
    assert!(requests[1].source.is_inline());

    let redeployed = h.store.find_installed_stack("adguard-home").await.unwrap().unwrap();
    assert_eq!(redeployed.installed_at, installed.installed_at);
    assert_eq!(redeployed.web_ui_port, Some(3001));
    assert_eq!(redeployed.env.get("TZ").map(String::as_str), Some("Africa/Tunis"));
}

#[tokio::test]
async fn test_redeploy_requires_installed_stack() {
    let h = Harness::new();
    let op = h
        .run("adguard-home", OperationParams::Redeploy(DeployParams::default()))
        .await;
    assert_eq!(op.status, OperationStatus::Error);
    assert!(op.error_message.unwrap().contains("not installed"));
    assert!(h.materializer.requests().is_empty());
}

#[tokio::test]
async fn test_port_boundaries() {
    let h = Harness::new();

    for port in [80, 70000, -1] {
        let op = h.run("adguard-home", install(Some(port), &[])).await;
        assert_eq!(op.status, OperationStatus::Error, "port {}", port);
        assert!(op.error_message.unwrap().contains(&port.to_string()));
    }
    assert!(h.compose.calls().is_empty());

    let op = h.run("adguard-home", install(Some(3001), &[])).await;
    assert_eq!(op.status, OperationStatus::Success);

    // Another app asking for the same port is told who owns it
    let op = h.run("homepage", install(Some(3001), &[])).await;
    assert_eq!(op.status, OperationStatus::Error);
    assert!(op.error_message.unwrap().contains("adguard-home"));

    // The owner itself may keep it
    let op = h
        .run("adguard-home", OperationParams::Redeploy(deploy(Some(3001), &[])))
        .await;
    assert_eq!(op.status, OperationStatus::Success, "{:?}", op.error_message);
}

#[tokio::test]
async fn test_uninstall_without_stack_is_noop() {
    let h = Harness::new();
    let op = h
        .run("homepage", OperationParams::Uninstall(UninstallParams::default()))
        .await;
    assert_eq!(op.status, OperationStatus::Success);
    assert_eq!(op.progress_percent, 100);
    assert!(h.compose.calls().is_empty());

    let latest = h.orchestrator.get_latest_event(&op.id).unwrap();
    assert_eq!(latest.message.as_deref(), Some("homepage is not installed"));
}

#[tokio::test]
async fn test_uninstall_removes_stack_and_data() {
    let h = Harness::new();
    let op = h.run("homepage", install(None, &[])).await;
    assert_eq!(op.status, OperationStatus::Success);
    assert!(h.data.path().join("homepage/app/config").is_dir());

    let op = h
        .run(
            "homepage",
            OperationParams::Uninstall(UninstallParams {
                remove_volumes: true,
                remove_data: true,
            }),
        )
        .await;
    assert_eq!(op.status, OperationStatus::Success, "{:?}", op.error_message);

    // Every named volume was converted, so none is left to remove
    assert_eq!(h.compose.calls(), vec!["up homepage", "down --volumes homepage"]);
    assert!(h.store.find_installed_stack("homepage").await.unwrap().is_none());
    assert!(!h.stacks.path().join("homepage").exists());
    assert!(!h.data.path().join("homepage").exists());
}

#[tokio::test]
async fn test_runtime_actions() {
    let h = Harness::new();
    let op = h.run("homepage", OperationParams::Stop).await;
    assert_eq!(op.status, OperationStatus::Error);
    assert!(h.compose.calls().is_empty());

    h.run("homepage", install(None, &[])).await;
    for (params, verb, message) in [
        (OperationParams::Stop, "stop", "Stopped homepage (1/1 containers running)"),
        (OperationParams::Start, "start", "Started homepage (1/1 containers running)"),
        (OperationParams::Restart, "restart", "Restarted homepage (1/1 containers running)"),
    ] {
        let op = h.run("homepage", params).await;
        assert_eq!(op.status, OperationStatus::Success);
        assert_eq!(h.compose.calls().last().unwrap(), &format!("{} homepage", verb));
        let latest = h.orchestrator.get_latest_event(&op.id).unwrap();
        assert_eq!(latest.message.as_deref(), Some(message));
    }
}

#[tokio::test]
async fn test_check_updates_records_state() {
    let h = Harness::new();
    h.run("homepage", install(None, &[])).await;
    *h.updates.resolution.lock().unwrap() = UpdateResolution {
        update_available: true,
        local_digest: Some("sha256:1111".to_string()),
        remote_digest: Some("sha256:2222".to_string()),
    };

    let op = h.run("homepage", OperationParams::CheckUpdates).await;
    assert_eq!(op.status, OperationStatus::Success);

    let state = h.store.find_update_state("homepage").await.unwrap().unwrap();
    assert!(state.update_available);
    assert_eq!(state.remote_digest.as_deref(), Some("sha256:2222"));
    let latest = h.orchestrator.get_latest_event(&op.id).unwrap();
    assert_eq!(latest.message.as_deref(), Some("Update available for homepage"));
}

#[tokio::test]
async fn test_progress_is_monotonic_until_terminal() {
    let h = Harness::new();
    let started = h
        .orchestrator
        .start_operation("adguard-home", install(None, &[]))
        .await
        .unwrap();
    let mut watch = h.orchestrator.watch(&started.operation_id);

    let mut events = Vec::new();
    if let Some(snapshot) = watch.snapshot.take() {
        events.push(snapshot);
    }
    while !events.last().is_some_and(|e| e.event_type.is_terminal()) {
        events.push(watch.recv().await.unwrap());
    }
    started.completion.await.unwrap();

    let (last, rest) = events.split_last().unwrap();
    assert_eq!(last.event_type, OperationEventType::Completed);
    assert_eq!(last.progress_percent, 100);
    let mut previous = 0;
    for event in rest {
        assert!(event.progress_percent < 100);
        assert!(event.progress_percent >= previous);
        previous = event.progress_percent;
    }
}

#[tokio::test]
async fn test_same_app_operations_run_in_order() {
    let h = Harness::new();
    let first = h
        .orchestrator
        .start_operation("homepage", install(None, &[]))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .start_operation("homepage", OperationParams::Stop)
        .await
        .unwrap();

    first.completion.await.unwrap();
    second.completion.await.unwrap();

    // The stop waited for the install, so the stack existed by then
    let stop = h
        .orchestrator
        .get_operation(&second.operation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stop.status, OperationStatus::Success, "{:?}", stop.error_message);
    assert_eq!(h.compose.calls(), vec!["up homepage", "stop homepage"]);

    let env: BTreeMap<String, String> = h
        .store
        .find_installed_stack("homepage")
        .await
        .unwrap()
        .unwrap()
        .env;
    assert!(env.is_empty());
}

const HOMEPAGE_SHARED_COMPOSE: &str = "\
services:
  homepage:
    image: ghcr.io/gethomepage/homepage:latest
    ports:
      - 3002:3000
    volumes:
      - config:/app/config

volumes:
  config:
";

const ADGUARD_SHARED_COMPOSE: &str = "\
services:
  adguard-home:
    image: adguard/adguardhome:v0.107.52
    ports:
      - \"3000:3000\"
    volumes:
      - config:/opt/adguardhome/conf

volumes:
  config:
";

fn redeploy_inline(compose: &str) -> OperationParams {
    OperationParams::Redeploy(DeployParams {
        compose_source: Some(compose.to_string()),
        ..Default::default()
    })
}

/// Collect every event of an operation started with `params`
async fn collect_events(h: &Harness, app_id: &str, params: OperationParams) -> Vec<StoreOperationEvent> {
    let started = h.orchestrator.start_operation(app_id, params).await.unwrap();
    let mut watch = h.orchestrator.watch(&started.operation_id);

    let mut events = Vec::new();
    if let Some(snapshot) = watch.snapshot.take() {
        events.push(snapshot);
    }
    while !events.last().is_some_and(|e| e.event_type.is_terminal()) {
        events.push(watch.recv().await.unwrap());
    }
    started.completion.await.unwrap();
    events
}

#[tokio::test]
async fn test_leftover_record_counts_as_not_installed() {
    let h = Harness::new();
    let stack_dir = h.stacks.path().join("homepage");
    std::fs::create_dir_all(&stack_dir).unwrap();
    std::fs::write(stack_dir.join("docker-compose.yml"), common::HOMEPAGE_COMPOSE).unwrap();
    h.store
        .upsert_installed_stack(&InstalledStackConfig {
            app_id: "homepage".to_string(),
            template_name: "homepage".to_string(),
            stack_name: "homepage".to_string(),
            compose_path: stack_dir.join("docker-compose.yml"),
            status: InstalledStackStatus::NotInstalled,
            web_ui_port: Some(3002),
            env: BTreeMap::new(),
            installed_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    for params in [
        OperationParams::Start,
        OperationParams::CheckUpdates,
        OperationParams::Redeploy(DeployParams::default()),
    ] {
        let op = h.run("homepage", params).await;
        assert_eq!(op.status, OperationStatus::Error);
        assert!(op.error_message.unwrap().contains("not installed"));
    }

    let op = h
        .run("homepage", OperationParams::Uninstall(UninstallParams::default()))
        .await;
    assert_eq!(op.status, OperationStatus::Success);
    let latest = h.orchestrator.get_latest_event(&op.id).unwrap();
    assert_eq!(latest.message.as_deref(), Some("homepage is not installed"));

    // No compose command ran and the leftover record is gone
    assert!(h.compose.calls().is_empty());
    assert!(h.store.find_installed_stack("homepage").await.unwrap().is_none());
}

#[tokio::test]
async fn test_install_over_leftover_record_is_fresh() {
    let h = Harness::new();
    h.store
        .upsert_installed_stack(&InstalledStackConfig {
            app_id: "homepage".to_string(),
            template_name: "homepage".to_string(),
            stack_name: "old-homepage".to_string(),
            compose_path: h.stacks.path().join("old-homepage/docker-compose.yml"),
            status: InstalledStackStatus::NotInstalled,
            web_ui_port: Some(4000),
            env: BTreeMap::new(),
            installed_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let op = h.run("homepage", install(None, &[])).await;
    assert_eq!(op.status, OperationStatus::Success, "{:?}", op.error_message);

    let requests = h.materializer.requests();
    assert_eq!(requests[0].strategy, StorageMappingStrategy::AppTargetPath);
    assert_eq!(requests[0].stack_name, "homepage");
    let stack = h.store.find_installed_stack("homepage").await.unwrap().unwrap();
    assert_eq!(stack.status, InstalledStackStatus::Installed);
    assert_eq!(stack.web_ui_port, Some(3002));
}

#[tokio::test]
async fn test_uninstall_keeps_data_shared_with_other_apps() {
    let h = Harness::new();
    for app_id in ["homepage", "adguard-home"] {
        let op = h.run(app_id, install(None, &[])).await;
        assert_eq!(op.status, OperationStatus::Success, "{:?}", op.error_message);
    }
    for (app_id, compose) in [
        ("homepage", HOMEPAGE_SHARED_COMPOSE),
        ("adguard-home", ADGUARD_SHARED_COMPOSE),
    ] {
        let op = h.run(app_id, redeploy_inline(compose)).await;
        assert_eq!(op.status, OperationStatus::Success, "{:?}", op.error_message);
    }

    // Both legacy layouts point at the same directory
    let shared = h.data.path().join("config");
    assert!(shared.is_dir());
    let homepage = h.store.find_installed_stack("homepage").await.unwrap().unwrap();
    let compose = std::fs::read_to_string(&homepage.compose_path).unwrap();
    assert!(compose.contains(&format!("{}:/app/config", shared.display())));

    let op = h
        .run(
            "adguard-home",
            OperationParams::Uninstall(UninstallParams {
                remove_volumes: false,
                remove_data: true,
            }),
        )
        .await;
    assert_eq!(op.status, OperationStatus::Success, "{:?}", op.error_message);

    assert!(shared.is_dir());
    assert!(!h.data.path().join("adguard-home").exists());
    let latest = h.orchestrator.get_latest_event(&op.id).unwrap();
    assert!(latest
        .message
        .as_deref()
        .unwrap()
        .contains("still mounted by homepage"));
}

#[tokio::test]
async fn test_queued_record_write_failure_is_returned() {
    let h = Harness::new();
    *h.store.fail_create.lock().unwrap() = true;

    let result = h
        .orchestrator
        .start_operation("homepage", install(None, &[]))
        .await;
    assert!(matches!(result, Err(AppError::PersistenceError(_))));
    assert!(h.compose.calls().is_empty());
    assert!(h.materializer.requests().is_empty());
}

#[tokio::test]
async fn test_update_write_failures_still_reach_terminal_event() {
    let h = Harness::new();
    // The started and first step patches are stored, every later one fails
    h.store.fail_updates_after(2);

    let events = collect_events(&h, "homepage", install(None, &[])).await;
    let last = events.last().unwrap();
    assert_eq!(last.event_type, OperationEventType::Completed);
    assert_eq!(last.status, OperationStatus::Success);
    assert_eq!(last.progress_percent, 100);

    let stored = h
        .orchestrator
        .get_operation(&last.operation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, OperationStatus::Running);
    assert_eq!(stored.progress_percent, 8);

    assert_eq!(h.compose.calls(), vec!["up homepage"]);
    assert!(h.store.find_installed_stack("homepage").await.unwrap().is_some());
}

#[tokio::test]
async fn test_pull_progress_events_are_broadcast() {
    let h = Harness::new();
    let events = collect_events(&h, "adguard-home", install(None, &[])).await;

    let pulls: Vec<&StoreOperationEvent> = events
        .iter()
        .filter(|e| e.event_type == OperationEventType::PullProgress)
        .collect();
    assert_eq!(pulls.len(), 2);
    for event in &pulls {
        assert_eq!(event.image.as_deref(), Some("adguard/adguardhome:v0.107.52"));
        assert!((15..=80).contains(&event.progress_percent), "{}", event.progress_percent);
        assert_eq!(event.status, OperationStatus::Running);
    }
    assert_eq!(pulls[0].docker_status.as_deref(), Some("Downloading"));
    assert_eq!(pulls[1].docker_status.as_deref(), Some("Pull complete"));
    assert!(pulls[0].progress_percent <= pulls[1].progress_percent);

    let op = h
        .orchestrator
        .get_operation(&events[0].operation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op.status, OperationStatus::Success);
}
