//! Engine-wide error taxonomy.
//!
//! Every service and storage method returns `Result<T, EngineError>`. The
//! command layer (`command::dispatch`) is the single place that catches
//! these and flattens them into a `CommandResult`; no other layer re-derives
//! its own error categories.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("invalid state: {message}")]
    State { message: String },

    #[error("could not acquire lock: {message}")]
    Lock { message: String },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("authorization failed: {message}")]
    Authorization { message: String },
}

impl EngineError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        EngineError::Conflict {
            message: message.into(),
        }
    }

    pub fn state(message: impl Into<String>) -> Self {
        EngineError::State {
            message: message.into(),
        }
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        EngineError::Authorization {
            message: message.into(),
        }
    }

    /// Stable machine-readable category, used by the command layer and the
    /// MCP/HTTP shells to pick a status code / error code without matching
    /// on the `Display` string.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "validation",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Conflict { .. } => "conflict",
            EngineError::State { .. } => "state",
            EngineError::Lock { .. } => "lock",
            EngineError::Storage(_) => "storage",
            EngineError::Authorization { .. } => "authorization",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
