//! Error types for meshplane

use thiserror::Error;

/// Result type alias using the meshplane Error
pub type Result<T> = std::result::Result<T, Error>;

/// meshplane error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No available IPs in network {network} ({cidr})")]
    Exhausted { network: String, cidr: String },

    #[error("Certificate signing failed: {0}")]
    Signing(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &str, id: impl ToString) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Whether the caller may re-read state and retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}
