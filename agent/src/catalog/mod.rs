//! Template lookup

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::AppError;
use crate::filesys::file::File;
use crate::models::template::AppTemplate;

/// Template lookup collaborator
#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    async fn find_catalog_template(&self, app_id: &str) -> Result<Option<AppTemplate>, AppError>;

    async fn find_custom_template(&self, app_id: &str) -> Result<Option<AppTemplate>, AppError>;
}

/// Catalog backed by two JSON files holding arrays of templates
pub struct JsonTemplateCatalog {
    catalog: Vec<AppTemplate>,
    custom: Vec<AppTemplate>,
}

impl JsonTemplateCatalog {
    pub fn new(catalog: Vec<AppTemplate>, custom: Vec<AppTemplate>) -> Self {
        Self { catalog, custom }
    }

    /// Load both files; a missing file is an empty list
    pub async fn open(catalog_file: &File, custom_file: &File) -> Result<Self, AppError> {
        let catalog = load_templates(catalog_file).await?;
        let custom = load_templates(custom_file).await?;
        debug!(
            "Loaded {} catalog and {} custom templates",
            catalog.len(),
            custom.len()
        );
        Ok(Self::new(catalog, custom))
    }
}

async fn load_templates(file: &File) -> Result<Vec<AppTemplate>, AppError> {
    if !file.exists().await {
        warn!("Template file {} not found, starting empty", file.path().display());
        return Ok(Vec::new());
    }
    file.read_json::<Vec<AppTemplate>>().await.map_err(|e| {
        AppError::ConfigError(format!("Invalid template file {}: {}", file.path().display(), e))
    })
}

#[async_trait]
impl TemplateCatalog for JsonTemplateCatalog {
    async fn find_catalog_template(&self, app_id: &str) -> Result<Option<AppTemplate>, AppError> {
        Ok(self
            .catalog
            .iter()
            .find(|t| t.template_name == app_id)
            .cloned())
    }

    async fn find_custom_template(&self, app_id: &str) -> Result<Option<AppTemplate>, AppError> {
        Ok(self
            .custom
            .iter()
            .find(|t| t.template_name == app_id)
            .cloned())
    }
}
