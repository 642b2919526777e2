//! Fake collaborators shared by the orchestrator and server tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_yaml::Value;
use tempfile::TempDir;

use stackd::cache::BroadcastInvalidator;
use stackd::catalog::JsonTemplateCatalog;
use stackd::deploy::compose::{ComposeDriver, ComposeTarget};
use stackd::deploy::docker::{UpdateResolution, UpdateResolver};
use stackd::deploy::materializer::{MaterializeRequest, Materializer, StackMaterializer};
use stackd::deploy::pull::{ImagePuller, PullEvent};
use stackd::errors::AppError;
use stackd::events::EventBus;
use stackd::models::operation::{OperationParams, OperationPatch, ProgressDetail, StoreOperation};
use stackd::models::stack::{
    AppUpdateState, ContainerState, InstalledStackConfig, MaterializedStack, RuntimeInfo,
};
use stackd::models::template::{AppTemplate, TemplateEnvVar};
use stackd::ops::{Collaborators, Orchestrator};
use stackd::storage::store::{JsonStackStore, StackStore};

pub const ADGUARD_COMPOSE: &str = "\
services:
  adguard-home:
    image: adguard/adguardhome:v0.107.52
    restart: unless-stopped
    environment:
      TZ: ${TZ}
    ports:
      - \"3000:3000\"
      - \"53:53/udp\"
    volumes:
      - work:/opt/adguardhome/work
      - conf:/opt/adguardhome/conf

volumes:
  work:
  conf:
";

pub const HOMEPAGE_COMPOSE: &str = "\
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

pub const IMMICH_INLINE_COMPOSE: &str = "\
services:
  immich-server:
    image: ghcr.io/immich-app/immich-server:release
    environment:
      DB_HOSTNAME: immich-postgres
      CUSTOM_ENV: \"yes\"
    ports:
      - \"2283:2283\"
    volumes:
      - upload:/usr/src/app/upload
  database:
    image: tensorchord/pgvecto-rs:pg14-v0.2.0

volumes:
  upload:
";

fn env_var(name: &str, default: Option<&str>) -> TemplateEnvVar {
    TemplateEnvVar {
        name: name.to_string(),
        default: default.map(str::to_string),
    }
}

/// Catalog templates hosted in the local repository `repo`
pub fn templates(repo: &Path) -> Vec<AppTemplate> {
    let repository_url = Some(repo.to_string_lossy().into_owned());
    vec![
        AppTemplate {
            template_name: "adguard-home".to_string(),
            name: "AdGuard Home".to_string(),
            repository_url: repository_url.clone(),
            stack_file: Some("adguard-home/docker-compose.yml".to_string()),
            compose_content: None,
            env: vec![env_var("TZ", Some("UTC"))],
            web_ui_port: Some(3000),
            primary_service: Some("adguard-home".to_string()),
        },
        AppTemplate {
            template_name: "homepage".to_string(),
            name: "Homepage".to_string(),
            repository_url: repository_url.clone(),
            stack_file: Some("homepage/docker-compose.yml".to_string()),
            compose_content: None,
            env: vec![],
            web_ui_port: Some(3002),
            primary_service: None,
        },
        AppTemplate {
            template_name: "immich".to_string(),
            name: "Immich".to_string(),
            repository_url,
            stack_file: Some("immich/docker-compose.yml".to_string()),
            compose_content: None,
            env: vec![env_var("TZ", Some("UTC")), env_var("UPLOAD_LOCATION", None)],
            web_ui_port: Some(2283),
            primary_service: Some("immich-server".to_string()),
        },
    ]
}

/// Compose driver recording every call as `"<verb> <project>"`
#[derive(Default)]
pub struct FakeCompose {
    pub calls: Mutex<Vec<String>>,
    pub fail_up: Mutex<bool>,
}

impl FakeCompose {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, verb: &str, target: &str) {
        self.calls.lock().unwrap().push(format!("{} {}", verb, target));
    }
}

#[async_trait]
impl ComposeDriver for FakeCompose {
    async fn up(&self, target: &ComposeTarget) -> Result<(), AppError> {
        self.record("up", &target.stack_name);
        if *self.fail_up.lock().unwrap() {
            return Err(AppError::ComposeError("port is already allocated".to_string()));
        }
        Ok(())
    }

    async fn down(&self, target: &ComposeTarget, remove_volumes: bool) -> Result<(), AppError> {
        let verb = if remove_volumes { "down --volumes" } else { "down" };
        self.record(verb, &target.stack_name);
        Ok(())
    }

    async fn start(&self, target: &ComposeTarget) -> Result<(), AppError> {
        self.record("start", &target.stack_name);
        Ok(())
    }

    async fn stop(&self, target: &ComposeTarget) -> Result<(), AppError> {
        self.record("stop", &target.stack_name);
        Ok(())
    }

    async fn restart(&self, target: &ComposeTarget) -> Result<(), AppError> {
        self.record("restart", &target.stack_name);
        Ok(())
    }

    /// Images of the rendered compose file, read the way `config --images` would
    async fn extract_images(&self, target: &ComposeTarget) -> Result<Vec<String>, AppError> {
        let content = std::fs::read_to_string(&target.compose_path)?;
        let doc: Value = serde_yaml::from_str(&content)?;
        let images = doc["services"]
            .as_mapping()
            .map(|services| {
                services
                    .values()
                    .filter_map(|s| s.get("image").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(images)
    }

    async fn get_runtime_info(&self, target: &ComposeTarget) -> Result<RuntimeInfo, AppError> {
        Ok(RuntimeInfo {
            containers: vec![ContainerState {
                name: format!("{}-1", target.stack_name),
                service: target.stack_name.clone(),
                state: "running".to_string(),
                status: "Up 2 seconds".to_string(),
            }],
        })
    }

    async fn remove_volume(&self, name: &str) -> Result<(), AppError> {
        self.record("volume rm", name);
        Err(AppError::ComposeError(format!("no such volume: {}", name)))
    }
}

/// Image puller reporting two events per image
#[derive(Default)]
pub struct FakePuller {
    pub failing: Mutex<HashSet<String>>,
    pub pulled: Mutex<Vec<String>>,
}

impl FakePuller {
    pub fn fail(&self, image: &str) {
        self.failing.lock().unwrap().insert(image.to_string());
    }
}

#[async_trait]
impl ImagePuller for FakePuller {
    async fn pull(
        &self,
        image: &str,
        on_event: &(dyn Fn(PullEvent) + Send + Sync),
    ) -> Result<(), AppError> {
        if self.failing.lock().unwrap().contains(image) {
            return Err(AppError::ImagePullError(format!(
                "pull access denied for {}",
                image
            )));
        }

        on_event(PullEvent {
            status: "Downloading".to_string(),
            progress_detail: Some(ProgressDetail {
                current: Some(50),
                total: Some(100),
                percent: None,
            }),
        });
        on_event(PullEvent {
            status: "Pull complete".to_string(),
            progress_detail: None,
        });
        self.pulled.lock().unwrap().push(image.to_string());
        Ok(())
    }
}

/// Update resolver returning a fixed answer
#[derive(Default)]
pub struct FakeUpdates {
    pub resolution: Mutex<UpdateResolution>,
}

#[async_trait]
impl UpdateResolver for FakeUpdates {
    async fn resolve_update_state(&self, _target: &ComposeTarget) -> Result<UpdateResolution, AppError> {
        Ok(self.resolution.lock().unwrap().clone())
    }
}

/// In-memory store whose operation writes can be made to fail
pub struct FlakyStore {
    inner: JsonStackStore,
    pub fail_create: Mutex<bool>,
    /// Number of operation updates accepted before every later one fails
    pub update_budget: Mutex<Option<usize>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: JsonStackStore::in_memory(),
            fail_create: Mutex::new(false),
            update_budget: Mutex::new(None),
        }
    }

    pub fn fail_updates_after(&self, accepted: usize) {
        *self.update_budget.lock().unwrap() = Some(accepted);
    }
}

#[async_trait]
impl StackStore for FlakyStore {
    async fn create_operation(&self, operation: &StoreOperation) -> Result<(), AppError> {
        if *self.fail_create.lock().unwrap() {
            return Err(AppError::PersistenceError("disk full".to_string()));
        }
        self.inner.create_operation(operation).await
    }

    async fn update_operation(
        &self,
        id: &str,
        patch: &OperationPatch,
    ) -> Result<StoreOperation, AppError> {
        {
            let mut budget = self.update_budget.lock().unwrap();
            match budget.as_mut() {
                Some(0) => return Err(AppError::PersistenceError("disk full".to_string())),
                Some(left) => *left -= 1,
                None => {}
            }
        }
        self.inner.update_operation(id, patch).await
    }

    async fn find_operation_by_id(&self, id: &str) -> Result<Option<StoreOperation>, AppError> {
        self.inner.find_operation_by_id(id).await
    }

    async fn find_installed_stack(
        &self,
        app_id: &str,
    ) -> Result<Option<InstalledStackConfig>, AppError> {
        self.inner.find_installed_stack(app_id).await
    }

    async fn list_installed_stacks(&self) -> Result<Vec<InstalledStackConfig>, AppError> {
        self.inner.list_installed_stacks().await
    }

    async fn find_stack_by_web_ui_port(
        &self,
        port: u16,
        exclude_app_id: Option<&str>,
    ) -> Result<Option<InstalledStackConfig>, AppError> {
        self.inner.find_stack_by_web_ui_port(port, exclude_app_id).await
    }

    async fn upsert_installed_stack(&self, stack: &InstalledStackConfig) -> Result<(), AppError> {
        self.inner.upsert_installed_stack(stack).await
    }

    async fn delete_installed_stack(&self, app_id: &str) -> Result<bool, AppError> {
        self.inner.delete_installed_stack(app_id).await
    }

    async fn upsert_update_state(&self, state: &AppUpdateState) -> Result<(), AppError> {
        self.inner.upsert_update_state(state).await
    }

    async fn find_update_state(&self, app_id: &str) -> Result<Option<AppUpdateState>, AppError> {
        self.inner.find_update_state(app_id).await
    }
}

/// Real materializer recording the requests it served
pub struct RecordingMaterializer {
    inner: StackMaterializer,
    pub requests: Mutex<Vec<MaterializeRequest>>,
}

impl RecordingMaterializer {
    pub fn requests(&self) -> Vec<MaterializeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Materializer for RecordingMaterializer {
    async fn materialize(&self, request: &MaterializeRequest) -> Result<MaterializedStack, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        self.inner.materialize(request).await
    }

    fn app_data_root(&self) -> &Path {
        self.inner.app_data_root()
    }
}

/// Orchestrator wired to fakes and scratch directories
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<FlakyStore>,
    pub compose: Arc<FakeCompose>,
    pub puller: Arc<FakePuller>,
    pub updates: Arc<FakeUpdates>,
    pub materializer: Arc<RecordingMaterializer>,
    pub cache: Arc<BroadcastInvalidator>,
    pub stacks: TempDir,
    pub data: TempDir,
    pub repo: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let stacks = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        for (app, compose) in [("adguard-home", ADGUARD_COMPOSE), ("homepage", HOMEPAGE_COMPOSE)] {
            std::fs::create_dir_all(repo.path().join(app)).unwrap();
            std::fs::write(repo.path().join(app).join("docker-compose.yml"), compose).unwrap();
        }

        let store = Arc::new(FlakyStore::new());
        let compose = Arc::new(FakeCompose::default());
        let puller = Arc::new(FakePuller::default());
        let updates = Arc::new(FakeUpdates::default());
        let materializer = Arc::new(RecordingMaterializer {
            inner: StackMaterializer::new(stacks.path(), data.path()),
            requests: Mutex::new(Vec::new()),
        });
        let cache = Arc::new(BroadcastInvalidator::default());

        let deps = Collaborators {
            store: store.clone(),
            catalog: Arc::new(JsonTemplateCatalog::new(templates(repo.path()), vec![])),
            materializer: materializer.clone(),
            compose: compose.clone(),
            puller: puller.clone(),
            updates: updates.clone(),
            cache: cache.clone(),
        };

        Self {
            orchestrator: Orchestrator::new(deps, EventBus::new(100)),
            store,
            compose,
            puller,
            updates,
            materializer,
            cache,
            stacks,
            data,
            repo,
        }
    }

    /// Run one operation to completion and return its final record
    pub async fn run(&self, app_id: &str, params: OperationParams) -> StoreOperation {
        let started = self
            .orchestrator
            .start_operation(app_id, params)
            .await
            .unwrap();
        started.completion.await.unwrap();
        self.orchestrator
            .get_operation(&started.operation_id)
            .await
            .unwrap()
            .unwrap()
    }
}
