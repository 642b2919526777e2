//! Error types for the stack daemon

use thiserror::Error;

/// Main error type for the stack daemon
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Compose file error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Docker error: {0}")]
    DockerError(#[from] bollard::errors::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Materialization error: {0}")]
    MaterializeError(String),

    #[error("Compose error: {0}")]
    ComposeError(String),

    #[error("Image pull error: {0}")]
    ImagePullError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure class of an [`AppError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any subprocess was touched
    Validation,
    /// Compose text could not be rendered
    Materialization,
    /// Compose subprocess or image pull failed
    Execution,
    /// Operation or stack records could not be written
    Persistence,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Materialization => "materialization",
            ErrorKind::Execution => "execution",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Internal => "internal",
        }
    }
}

impl AppError {
    /// Classify the error for logging and reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::ValidationError(_) | AppError::NotFound(_) | AppError::YamlError(_) => {
                ErrorKind::Validation
            }
            AppError::MaterializeError(_) => ErrorKind::Materialization,
            AppError::ComposeError(_)
            | AppError::ImagePullError(_)
            | AppError::DockerError(_)
            | AppError::HttpError(_) => ErrorKind::Execution,
            AppError::PersistenceError(_) | AppError::JsonError(_) => ErrorKind::Persistence,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
