//! Error types for Memo Core.
//!
//! This module defines all error types used throughout the library.
//! The variants follow the failure classes the sync engine cares about:
//! network failures are recoverable, store failures abort the operation,
//! version problems need a user decision, and an invalid access token is
//! handled by the account layer.

use thiserror::Error;

/// Result type alias for Memo operations
pub type MemoResult<T> = Result<T, MemoError>;

/// Main error type for Memo operations
#[derive(Error, Debug)]
pub enum MemoError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database operation failed: {0}")]
    DatabaseOperation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Access token is invalid")]
    AccessTokenInvalid,

    #[error("Server version {version} is not supported: {message}")]
    VersionIncompatible { version: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl MemoError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        MemoError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network(message: impl Into<String>) -> Self {
        MemoError::Network(message.into())
    }

    /// Create a new database operation error
    pub fn database_op(message: impl Into<String>) -> Self {
        MemoError::DatabaseOperation(message.into())
    }

    /// Authentication failures are reported by the account layer, not here.
    pub fn is_access_token_invalid(&self) -> bool {
        matches!(self, MemoError::AccessTokenInvalid)
    }

    /// True for failures that may succeed on the next explicit user action.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MemoError::Network(_))
    }
}

impl From<reqwest::Error> for MemoError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            MemoError::AccessTokenInvalid
        } else {
            MemoError::Network(err.to_string())
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for MemoError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        MemoError::database_op(format!("store lock poisoned: {}", err))
    }
}
