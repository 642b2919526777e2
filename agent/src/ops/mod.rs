//! Operation orchestrator
//!
//! Every lifecycle request becomes a queued [`StoreOperation`] whose id is
//! returned right away. The steps run on a detached task that patches the
//! record, broadcasts events and ends in `success` or `error`.

pub mod install;
pub mod locks;
pub mod resolve;
pub mod runtime;
pub mod uninstall;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::CacheInvalidator;
use crate::catalog::TemplateCatalog;
use crate::deploy::compose::ComposeDriver;
use crate::deploy::docker::UpdateResolver;
use crate::deploy::materializer::Materializer;
use crate::deploy::pull::{ImagePuller, PullObserver, PullProgress};
use crate::errors::AppError;
use crate::events::{EventBus, OperationWatch, Subscription};
use crate::models::operation::{
    OperationEventType, OperationParams, OperationPatch, OperationStatus, StoreOperation,
    StoreOperationEvent,
};
use crate::models::stack::InstalledStackConfig;
use crate::ops::locks::AppLocks;
use crate::storage::store::StackStore;

/// External collaborators driven by the orchestrator
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn StackStore>,
    pub catalog: Arc<dyn TemplateCatalog>,
    pub materializer: Arc<dyn Materializer>,
    pub compose: Arc<dyn ComposeDriver>,
    pub puller: Arc<dyn ImagePuller>,
    pub updates: Arc<dyn UpdateResolver>,
    pub cache: Arc<dyn CacheInvalidator>,
}

/// Handle of a started operation
pub struct StartedOperation {
    pub operation_id: String,

    /// Completes once the operation reached a terminal state.
    /// Dropping it leaves the operation running.
    pub completion: JoinHandle<()>,
}

/// Runs lifecycle operations
#[derive(Clone)]
pub struct Orchestrator {
    deps: Collaborators,
    bus: EventBus,
    locks: Arc<AppLocks>,
}

impl Orchestrator {
    pub fn new(deps: Collaborators, bus: EventBus) -> Self {
        Self {
            deps,
            bus,
            locks: Arc::new(AppLocks::new()),
        }
    }

    /// Queue an operation for `app_id` and run it in the background.
    ///
    /// Only a failure to persist the queued record is reported here; every
    /// later failure ends up in the operation record and its events.
    pub async fn start_operation(
        &self,
        app_id: &str,
        params: OperationParams,
    ) -> Result<StartedOperation, AppError> {
        let operation = StoreOperation::queued(app_id, params.action());
        self.deps.store.create_operation(&operation).await?;

        info!(
            operation_id = %operation.id,
            app_id = %operation.app_id,
            action = %operation.action,
            "Operation queued"
        );

        let operation_id = operation.id.clone();
        let this = self.clone();
        let completion = tokio::spawn(async move {
            this.execute(operation, params).await;
        });

        Ok(StartedOperation {
            operation_id,
            completion,
        })
    }

    pub async fn get_operation(&self, operation_id: &str) -> Result<Option<StoreOperation>, AppError> {
        self.deps.store.find_operation_by_id(operation_id).await
    }

    pub fn subscribe<F>(&self, operation_id: &str, handler: F) -> Subscription
    where
        F: Fn(&StoreOperationEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(operation_id, handler)
    }

    pub fn get_latest_event(&self, operation_id: &str) -> Option<StoreOperationEvent> {
        self.bus.get_latest(operation_id)
    }

    /// Snapshot-then-stream view of an operation
    pub fn watch(&self, operation_id: &str) -> OperationWatch {
        self.bus.watch(operation_id)
    }

    async fn execute(self, operation: StoreOperation, params: OperationParams) {
        let app_id = operation.app_id.clone();
        let _lock = self.locks.acquire(&app_id).await;

        let mut run = OperationRun::new(self.clone(), operation);
        run.emit(
            OperationEventType::Started,
            OperationPatch {
                status: Some(OperationStatus::Running),
                progress_percent: Some(1),
                current_step: Some(format!("Starting {}", params.action())),
                error_message: None,
            },
            EventExtras::default(),
        )
        .await;

        let result = match params {
            OperationParams::Install(deploy) => install::deploy(&mut run, deploy, false).await,
            OperationParams::Redeploy(deploy) => install::deploy(&mut run, deploy, true).await,
            OperationParams::Uninstall(options) => uninstall::uninstall(&mut run, options).await,
            OperationParams::Start | OperationParams::Stop | OperationParams::Restart => {
                runtime::runtime_action(&mut run, params.action()).await
            }
            OperationParams::CheckUpdates => runtime::check_updates(&mut run).await,
        };

        match result {
            Ok(message) => run.complete(message).await,
            Err(e) => {
                error!(
                    operation_id = %run.operation.id,
                    app_id = %app_id,
                    kind = e.kind().as_str(),
                    "Operation failed: {}",
                    e
                );
                run.fail(e.to_string()).await;
            }
        }

        self.deps.cache.invalidate(&app_id);
    }
}

/// Optional fields of a broadcast event
#[derive(Debug, Clone, Default)]
pub(crate) struct EventExtras {
    pub message: Option<String>,
    pub image: Option<String>,
    pub docker_status: Option<String>,
    pub progress_detail: Option<crate::models::operation::ProgressDetail>,
}

/// One executing operation and its latest known state
pub(crate) struct OperationRun {
    orchestrator: Orchestrator,
    operation: StoreOperation,
}

impl OperationRun {
    fn new(orchestrator: Orchestrator, operation: StoreOperation) -> Self {
        Self {
            orchestrator,
            operation,
        }
    }

    pub(crate) fn deps(&self) -> &Collaborators {
        &self.orchestrator.deps
    }

    pub(crate) fn app_id(&self) -> &str {
        &self.operation.app_id
    }

    /// Installed stack of this app. A record left in `not_installed` counts as absent.
    pub(crate) async fn installed_stack(&self) -> Result<Option<InstalledStackConfig>, AppError> {
        Ok(self
            .deps()
            .store
            .find_installed_stack(self.app_id())
            .await?
            .filter(InstalledStackConfig::is_installed))
    }

    /// Advance to `progress` with a new step label
    pub(crate) async fn step(&mut self, progress: u8, step: impl Into<String>) {
        self.emit(
            OperationEventType::Step,
            OperationPatch {
                status: Some(OperationStatus::Running),
                progress_percent: Some(progress),
                current_step: Some(step.into()),
                error_message: None,
            },
            EventExtras::default(),
        )
        .await;
    }

    async fn complete(&mut self, message: String) {
        self.emit(
            OperationEventType::Completed,
            OperationPatch {
                status: Some(OperationStatus::Success),
                progress_percent: Some(100),
                current_step: Some("Completed".to_string()),
                error_message: None,
            },
            EventExtras {
                message: Some(message),
                ..Default::default()
            },
        )
        .await;
    }

    async fn fail(&mut self, message: String) {
        self.emit(
            OperationEventType::Failed,
            OperationPatch {
                status: Some(OperationStatus::Error),
                progress_percent: Some(100),
                current_step: Some("Failed".to_string()),
                error_message: Some(message.clone()),
            },
            EventExtras {
                message: Some(message),
                ..Default::default()
            },
        )
        .await;
    }

    /// Persist `patch` and broadcast the resulting state.
    ///
    /// Persistence failures are logged and the local copy is patched
    /// instead, so the operation keeps going and listeners stay informed.
    async fn emit(&mut self, event_type: OperationEventType, patch: OperationPatch, extras: EventExtras) {
        self.persist(&patch).await;

        if event_type != OperationEventType::PullProgress {
            info!(
                operation_id = %self.operation.id,
                app_id = %self.operation.app_id,
                action = %self.operation.action,
                status = %self.operation.status,
                progress = self.operation.progress_percent,
                step = %self.operation.current_step,
                "{}",
                event_type.as_str()
            );
        }

        self.broadcast(event_type, extras);
    }

    async fn persist(&mut self, patch: &OperationPatch) {
        match self
            .orchestrator
            .deps
            .store
            .update_operation(&self.operation.id, patch)
            .await
        {
            Ok(updated) => self.operation = updated,
            Err(e) => {
                warn!(
                    operation_id = %self.operation.id,
                    "Unable to persist operation update: {}",
                    e
                );
                if let Err(e) = self.operation.apply(patch) {
                    warn!(operation_id = %self.operation.id, "Ignoring operation update: {}", e);
                }
            }
        }
    }

    fn broadcast(&self, event_type: OperationEventType, extras: EventExtras) {
        let mut event = StoreOperationEvent::from_operation(event_type, &self.operation);
        event.message = extras.message;
        event.image = extras.image;
        event.docker_status = extras.docker_status;
        event.progress_detail = extras.progress_detail;
        self.orchestrator.bus.publish(event);
    }
}

#[async_trait]
impl PullObserver for OperationRun {
    async fn on_progress(&mut self, progress: PullProgress) {
        // Only persist when the integer percent moves
        if progress.progress_percent > self.operation.progress_percent {
            self.persist(&OperationPatch {
                progress_percent: Some(progress.progress_percent),
                ..Default::default()
            })
            .await;
        }

        let mut detail = progress.event.progress_detail.unwrap_or_default();
        detail.percent = Some(progress.image_percent);

        self.broadcast(
            OperationEventType::PullProgress,
            EventExtras {
                message: Some(format!("Pulling {}", progress.image)),
                image: Some(progress.image),
                docker_status: Some(progress.event.status),
                progress_detail: Some(detail),
            },
        );
    }
}
