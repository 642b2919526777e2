//! App templates

use serde::{Deserialize, Serialize};

/// An environment variable a template declares as configurable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateEnvVar {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// An installable app, either from the catalog or user-defined
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppTemplate {
    /// Catalog key of the template
    pub template_name: String,

    /// Display name
    pub name: String,

    /// Repository hosting the stack file (http(s) URL, file:// URL or local directory)
    #[serde(default)]
    pub repository_url: Option<String>,

    /// Path of the compose file inside the repository
    #[serde(default)]
    pub stack_file: Option<String>,

    /// Inline compose definition (custom templates)
    #[serde(default)]
    pub compose_content: Option<String>,

    #[serde(default)]
    pub env: Vec<TemplateEnvVar>,

    /// Published web UI port the stack file uses by default
    #[serde(default)]
    pub web_ui_port: Option<u16>,

    /// Compose service carrying the web UI and the user-facing environment
    #[serde(default)]
    pub primary_service: Option<String>,
}

impl AppTemplate {
    /// Whether `key` is one of the declared environment variables
    pub fn declares_env(&self, key: &str) -> bool {
        self.env.iter().any(|var| var.name == key)
    }
}
