use crate::db::PoolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbalError>;

/// Boxed error type used for factory-provided failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DbalError {
    // Standard library errors with automatic conversion
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl DbalError {
    /// Whether the failure is the caller's to retry later (pool pressure)
    /// rather than a broken deployment.
    pub fn is_transient(&self) -> bool {
        match self {
            DbalError::Pool(e) => e.is_retryable(),
            DbalError::Database(_) => true,
            _ => false,
        }
    }
}

impl From<tokio_postgres::Error> for DbalError {
    fn from(err: tokio_postgres::Error) -> Self {
        DbalError::Database(err.to_string())
    }
}

impl From<&str> for DbalError {
    fn from(msg: &str) -> Self {
        DbalError::Internal(msg.to_string())
    }
}

impl From<String> for DbalError {
    fn from(msg: String) -> Self {
        DbalError::Internal(msg)
    }
}

// Convert from anyhow::Error for CLI integration
impl From<anyhow::Error> for DbalError {
    fn from(err: anyhow::Error) -> Self {
        DbalError::Internal(err.to_string())
    }
}
