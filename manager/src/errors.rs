//! Error types for the runner manager

use std::time::Duration;

use thiserror::Error;

/// Main error type for the runner manager
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// A registry, build, runtime or webhook call failed. Retryable at cycle granularity.
    #[error("{operation} failed: {message}")]
    TransientExternal { operation: String, message: String },

    /// An external call exceeded its time budget.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The requested transition is not valid for the instance's current state.
    #[error("Invalid transition for {id}: {from} -> {to}")]
    StateConflict {
        id: String,
        from: String,
        to: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Capacity conflict: {0}")]
    CapacityConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    pub fn external(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ManagerError::TransientExternal {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Whether the failure may go away on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ManagerError::TransientExternal { .. }
                | ManagerError::Timeout { .. }
                | ManagerError::HttpError(_)
                | ManagerError::IoError(_)
        )
    }
}

impl From<anyhow::Error> for ManagerError {
    fn from(err: anyhow::Error) -> Self {
        ManagerError::Internal(err.to_string())
    }
}

/// Bound an external call by `after`, mapping an elapsed deadline to [`ManagerError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, after: Duration, fut: F) -> Result<T, ManagerError>
where
    F: std::future::Future<Output = Result<T, ManagerError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ManagerError::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}
