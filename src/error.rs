//! Error taxonomy for the update engine.
//!
//! Callers branch on [`EngineError::is_busy`] to tell the "retry later"
//! signal apart from real failures.

use thiserror::Error;

use crate::graph::CycleError;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Another update for the same container identity holds the lease.
    #[error("update already in progress for {0}")]
    UpdateInProgress(String),

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Pull, swap, or daemon failure.
    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("hook `{command}` failed: {reason}")]
    Hook { command: String, reason: String },

    #[error("no snapshot recorded for {0}")]
    NoSnapshot(String),

    /// The container is in neither the old nor the new confirmed-good state.
    #[error("rollback of {name} failed: {reason}")]
    RollbackFailed { name: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("remote host {host}: {reason}")]
    Remote { host: String, reason: String },

    #[error("settings store error: {0}")]
    Store(String),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, EngineError::UpdateInProgress(_))
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        EngineError::Runtime(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}
