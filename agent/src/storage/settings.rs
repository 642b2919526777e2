//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;
use crate::storage::layout::StorageLayout;

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Base directory; every unset path below is derived from it
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    /// One directory per app holding `docker-compose.yml` and `.env`
    #[serde(default)]
    pub stacks_root: Option<PathBuf>,

    /// Root of bind-mounted app data
    #[serde(default)]
    pub app_data_root: Option<PathBuf>,

    /// Operation and stack records
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Catalog templates
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,

    /// User-defined templates
    #[serde(default)]
    pub custom_templates_file: Option<PathBuf>,

    /// Command prefix used to invoke compose
    #[serde(default = "default_compose_command")]
    pub compose_command: Vec<String>,

    /// Docker CLI used for volume removal and digest lookups
    #[serde(default = "default_docker_command")]
    pub docker_command: String,

    /// Local HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Number of operations whose latest event is kept for late subscribers
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_compose_command() -> Vec<String> {
    vec!["docker".to_string(), "compose".to_string()]
}

fn default_docker_command() -> String {
    "docker".to_string()
}

fn default_event_bus_capacity() -> usize {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            base_dir: None,
            stacks_root: None,
            app_data_root: None,
            state_file: None,
            catalog_file: None,
            custom_templates_file: None,
            compose_command: default_compose_command(),
            docker_command: default_docker_command(),
            server: ServerSettings::default(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl Settings {
    /// Storage layout rooted at `base_dir` or the platform default
    pub fn layout(&self) -> StorageLayout {
        match &self.base_dir {
            Some(dir) => StorageLayout::new(dir.clone()),
            None => StorageLayout::default(),
        }
    }

    pub fn stacks_root(&self) -> PathBuf {
        self.stacks_root
            .clone()
            .unwrap_or_else(|| self.layout().stacks_dir().path().to_path_buf())
    }

    pub fn app_data_root(&self) -> PathBuf {
        self.app_data_root
            .clone()
            .unwrap_or_else(|| self.layout().app_data_dir().path().to_path_buf())
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.layout().state_file().path().to_path_buf())
    }

    pub fn catalog_file(&self) -> PathBuf {
        self.catalog_file
            .clone()
            .unwrap_or_else(|| self.layout().catalog_file().path().to_path_buf())
    }

    pub fn custom_templates_file(&self) -> PathBuf {
        self.custom_templates_file
            .clone()
            .unwrap_or_else(|| self.layout().custom_templates_file().path().to_path_buf())
    }
}

/// Local HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_server_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8787
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}
