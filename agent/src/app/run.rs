//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::cache::BroadcastInvalidator;
use crate::catalog::JsonTemplateCatalog;
use crate::deploy::compose::{ComposeCli, ComposeDriver};
use crate::deploy::docker::{CliUpdateResolver, DockerPuller};
use crate::deploy::materializer::StackMaterializer;
use crate::errors::AppError;
use crate::events::EventBus;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::ops::{Collaborators, Orchestrator};
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::storage::store::JsonStackStore;

/// Run the stack daemon until `shutdown_signal` resolves
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AppError> {
    info!("Initializing stackd {}...", version);

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start stackd: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), AppError> {
    let orchestrator = init_orchestrator(options).await?;
    init_socket_server(options, orchestrator, shutdown_manager, shutdown_tx.subscribe()).await
}

async fn init_orchestrator(options: &AppOptions) -> Result<Orchestrator, AppError> {
    let storage = &options.storage;
    if options.create_dirs {
        Dir::new(storage.stacks_root.clone()).create().await?;
        Dir::new(storage.app_data_root.clone()).create().await?;
    }

    info!("Opening state file {}", storage.state_file.display());
    let store = JsonStackStore::open(File::new(storage.state_file.clone())).await?;

    let catalog = JsonTemplateCatalog::open(
        &File::new(storage.catalog_file.clone()),
        &File::new(storage.custom_templates_file.clone()),
    )
    .await?;

    let compose: Arc<dyn ComposeDriver> = Arc::new(ComposeCli::new(
        options.runtime.compose_command.clone(),
        options.runtime.docker_command.clone(),
    ));
    let updates = CliUpdateResolver::new(compose.clone(), options.runtime.docker_command.clone());
    let puller = DockerPuller::connect()?;
    debug!(
        "Compose command: {:?}, docker command: {}",
        options.runtime.compose_command, options.runtime.docker_command
    );

    let deps = Collaborators {
        store: Arc::new(store),
        catalog: Arc::new(catalog),
        materializer: Arc::new(StackMaterializer::new(
            storage.stacks_root.clone(),
            storage.app_data_root.clone(),
        )),
        compose,
        puller: Arc::new(puller),
        updates: Arc::new(updates),
        cache: Arc::new(BroadcastInvalidator::default()),
    };

    Ok(Orchestrator::new(deps, EventBus::new(options.event_bus_capacity)))
}

async fn init_socket_server(
    options: &AppOptions,
    orchestrator: Orchestrator,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AppError> {
    info!("Initializing local HTTP server...");

    let server_state = ServerState::new(orchestrator);
    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_socket_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    socket_server_handle: Option<JoinHandle<Result<(), AppError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            socket_server_handle: None,
        }
    }

    pub fn with_socket_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), AppError>>,
    ) -> Result<(), AppError> {
        if self.socket_server_handle.is_some() {
            return Err(AppError::ShutdownError("server_handle already set".to_string()));
        }
        self.socket_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AppError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AppError> {
        info!("Shutting down stackd...");

        // Operations still in flight are detached and end with the runtime
        if let Some(handle) = self.socket_server_handle.take() {
            handle.await.map_err(|e| AppError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
