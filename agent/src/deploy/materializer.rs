//! Stack materialization
//!
//! Renders the compose definition of one app into its stack directory:
//! port override, storage-mapping rewrite, bind directories and the
//! `docker-compose.yml` + `.env` pair handed to the compose tool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use crate::deploy::rewriter::{override_published_port, ComposeRewriter, LineRewriter, StorageContext};
use crate::errors::AppError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::stack::{MaterializedStack, StorageMappingStrategy};
use crate::utils::is_safe_path_segment;

pub const COMPOSE_FILE_NAME: &str = "docker-compose.yml";
pub const ENV_FILE_NAME: &str = ".env";

/// Where the compose text of a materialization comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeSource {
    /// Compose text supplied directly (user input or a previously installed stack)
    Inline(String),
    /// Compose file hosted in a template repository
    Template {
        repository_url: String,
        stack_file: String,
    },
}

impl ComposeSource {
    pub fn is_inline(&self) -> bool {
        matches!(self, ComposeSource::Inline(_))
    }
}

/// Input of [`Materializer::materialize`]
#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    pub app_id: String,
    pub stack_name: String,
    pub source: ComposeSource,
    pub env: BTreeMap<String, String>,
    /// Host port written into the first published port mapping
    pub web_ui_port_override: Option<u16>,
    /// Port reported back when no override is applied
    pub web_ui_port: Option<u16>,
    pub strategy: StorageMappingStrategy,
}

/// Stack rendering collaborator of the orchestrator
#[async_trait]
pub trait Materializer: Send + Sync {
    async fn materialize(&self, request: &MaterializeRequest) -> Result<MaterializedStack, AppError>;

    /// Root under which bind-mount directories are created
    fn app_data_root(&self) -> &Path;
}

/// Renders stacks under a stacks root and an app-data root
pub struct StackMaterializer {
    stacks_root: PathBuf,
    app_data_root: PathBuf,
    http: reqwest::Client,
    rewriter: Arc<dyn ComposeRewriter>,
}

impl StackMaterializer {
    pub fn new(stacks_root: impl Into<PathBuf>, app_data_root: impl Into<PathBuf>) -> Self {
        Self::with_rewriter(stacks_root, app_data_root, Arc::new(LineRewriter))
    }

    /// Materializer using another [`ComposeRewriter`]
    pub fn with_rewriter(
        stacks_root: impl Into<PathBuf>,
        app_data_root: impl Into<PathBuf>,
        rewriter: Arc<dyn ComposeRewriter>,
    ) -> Self {
        Self {
            stacks_root: stacks_root.into(),
            app_data_root: app_data_root.into(),
            http: reqwest::Client::new(),
            rewriter,
        }
    }

    /// Directory holding the compose and env files of `app_id`
    pub fn stack_dir(&self, app_id: &str) -> Dir {
        Dir::new(self.stacks_root.join(app_id))
    }

    /// Render `request` into its stack directory
    pub async fn render(&self, request: &MaterializeRequest) -> Result<MaterializedStack, AppError> {
        if !is_safe_path_segment(&request.app_id) {
            return Err(AppError::MaterializeError(format!(
                "App id '{}' cannot be used as a directory name",
                request.app_id
            )));
        }

        let mut compose = self.load_source(&request.source).await?;

        if let Some(port) = request.web_ui_port_override {
            compose = override_published_port(&compose, port, None)?;
        }

        let rewritten = self.rewriter.rewrite(
            &compose,
            &StorageContext {
                app_id: &request.app_id,
                app_data_root: &self.app_data_root,
                strategy: request.strategy,
            },
        )?;

        for dir in &rewritten.bind_dirs {
            Dir::new(dir.clone()).create().await.map_err(|e| {
                AppError::MaterializeError(format!("Unable to create {}: {}", dir.display(), e))
            })?;
        }

        let stack_dir = self.stack_dir(&request.app_id);
        stack_dir.create().await?;

        let compose_file = stack_dir.file(COMPOSE_FILE_NAME);
        compose_file.write_atomic(rewritten.content.as_bytes()).await?;

        let env_file = stack_dir.file(ENV_FILE_NAME);
        env_file.write_atomic(render_env_file(&request.env).as_bytes()).await?;

        info!(
            "Materialized stack {} for {} ({} bind mounts, strategy {})",
            request.stack_name,
            request.app_id,
            rewritten.bind_dirs.len(),
            request.strategy
        );

        Ok(MaterializedStack {
            stack_dir: stack_dir.path().to_path_buf(),
            compose_path: compose_file.path().to_path_buf(),
            env_path: env_file.path().to_path_buf(),
            stack_name: request.stack_name.clone(),
            web_ui_port: request.web_ui_port_override.or(request.web_ui_port),
        })
    }

    /// Read the compose text of `source`
    pub async fn load_source(&self, source: &ComposeSource) -> Result<String, AppError> {
        match source {
            ComposeSource::Inline(content) => Ok(content.clone()),
            ComposeSource::Template {
                repository_url,
                stack_file,
            } => self.fetch_template(repository_url, stack_file).await,
        }
    }

    async fn fetch_template(&self, repository_url: &str, stack_file: &str) -> Result<String, AppError> {
        if stack_file.split('/').any(|s| s == "..") {
            return Err(AppError::ValidationError(format!(
                "Stack file '{}' leaves its repository",
                stack_file
            )));
        }
        let stack_file = stack_file.trim_start_matches('/');

        match Url::parse(repository_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                let base = if url.path().ends_with('/') {
                    url
                } else {
                    let mut url = url;
                    let path = format!("{}/", url.path());
                    url.set_path(&path);
                    url
                };
                let file_url = base
                    .join(stack_file)
                    .map_err(|e| AppError::ValidationError(format!("Invalid stack file URL: {}", e)))?;

                debug!("Fetching stack file {}", file_url);
                let response = self.http.get(file_url.clone()).send().await?;
                if !response.status().is_success() {
                    return Err(AppError::MaterializeError(format!(
                        "Fetching {} returned {}",
                        file_url,
                        response.status()
                    )));
                }
                Ok(response.text().await?)
            }
            Ok(url) if url.scheme() == "file" => {
                let root = url.to_file_path().map_err(|_| {
                    AppError::ValidationError(format!("Invalid file URL: {}", repository_url))
                })?;
                self.read_local(&root, stack_file).await
            }
            Ok(url) => Err(AppError::ValidationError(format!(
                "Unsupported repository scheme: {}",
                url.scheme()
            ))),
            Err(_) => self.read_local(Path::new(repository_url), stack_file).await,
        }
    }

    async fn read_local(&self, root: &Path, stack_file: &str) -> Result<String, AppError> {
        let file = File::new(root.join(stack_file));
        if !file.exists().await {
            return Err(AppError::MaterializeError(format!(
                "Stack file {} does not exist",
                file.path().display()
            )));
        }
        file.read_string().await
    }
}

#[async_trait]
impl Materializer for StackMaterializer {
    async fn materialize(&self, request: &MaterializeRequest) -> Result<MaterializedStack, AppError> {
        self.render(request).await
    }

    fn app_data_root(&self) -> &Path {
        &self.app_data_root
    }
}

/// Serialize `env` as `KEY=value` lines in key order.
///
/// Values with whitespace, quotes, `#`, `$` or backslashes are double-quoted
/// with `"`, `\` and `$` escaped.
pub fn render_env_file(env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(key);
        out.push('=');
        out.push_str(&quote_env_value(value));
        out.push('\n');
    }
    out
}

fn quote_env_value(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '#' | '$' | '\\' | '`'));
    if !needs_quotes {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' | '$' | '`' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\n' => quoted.push_str("\\n"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}
