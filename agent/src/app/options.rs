//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::storage::settings::{ServerSettings, Settings};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Local HTTP server configuration
    pub server: ServerSettings,

    /// Compose and docker invocation
    pub runtime: RuntimeOptions,

    /// Number of operations whose latest event is kept for late subscribers
    pub event_bus_capacity: usize,

    /// Create the stacks and app data roots on startup
    pub create_dirs: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for AppOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions {
                stacks_root: settings.stacks_root(),
                app_data_root: settings.app_data_root(),
                state_file: settings.state_file(),
                catalog_file: settings.catalog_file(),
                custom_templates_file: settings.custom_templates_file(),
            },
            server: settings.server.clone(),
            runtime: RuntimeOptions {
                compose_command: settings.compose_command.clone(),
                docker_command: settings.docker_command.clone(),
            },
            event_bus_capacity: settings.event_bus_capacity,
            create_dirs: true,
        }
    }
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Resolved storage paths
#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub stacks_root: PathBuf,
    pub app_data_root: PathBuf,
    pub state_file: PathBuf,
    pub catalog_file: PathBuf,
    pub custom_templates_file: PathBuf,
}

/// Container runtime commands
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Command prefix used to invoke compose, e.g. `docker compose`
    pub compose_command: Vec<String>,

    /// Docker CLI binary
    pub docker_command: String,
}
