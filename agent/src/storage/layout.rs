//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the daemon
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Get the operation and stack records file
    pub fn state_file(&self) -> File {
        File::new(self.base_dir.join("state.json"))
    }

    /// Get the app catalog file
    pub fn catalog_file(&self) -> File {
        File::new(self.base_dir.join("catalog.json"))
    }

    /// Get the user-defined templates file
    pub fn custom_templates_file(&self) -> File {
        File::new(self.base_dir.join("custom-templates.json"))
    }

    /// Get the directory holding one compose stack per app
    pub fn stacks_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("stacks"))
    }

    /// Get the root of bind-mounted app data
    pub fn app_data_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("app-data"))
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        // Use /etc/stackd on Linux, or user home directory on other platforms
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/etc/stackd");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stackd");

        Self::new(base_dir)
    }
}
