//! Errors raised by schedule and execution stores.

use thiserror::Error;

use crate::model::ExecutionStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("invalid status transition for execution {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub(crate) fn schedule_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "schedule",
            id: id.into(),
        }
    }

    pub(crate) fn execution_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "execution",
            id: id.into(),
        }
    }

    /// Whether the error reports a missing record.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Rejected run parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("parameters must be a JSON object")]
    NotAnObject,

    #[error("parameter '{key}' must be a string, number, boolean or null")]
    Unsupported { key: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
