//! Error types for orchestrator operations.

use std::time::Duration;

use pipeline_store::{ExecutionStatus, ParameterError, StoreError};
use thiserror::Error;

use crate::cron::CronError;

/// Errors returned synchronously by [`Orchestrator`](crate::Orchestrator) calls.
///
/// Failures of asynchronous work (enqueueing, worker callbacks) never surface
/// here; they are recorded on the affected execution instead.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("execution {execution_id} cannot move from {from} to {to}")]
    InvalidTransition {
        execution_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("failed to enqueue pipeline run: {0}")]
    EnqueueFailure(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(#[from] ParameterError),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    #[error("store error: {0}")]
    Store(StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub(crate) fn invalid_expression(expression: &str, err: &CronError) -> Self {
        Self::InvalidExpression {
            expression: expression.to_string(),
            reason: err.to_string(),
        }
    }

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
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            StoreError::InvalidTransition { id, from, to } => Self::InvalidTransition {
                execution_id: id,
                from,
                to,
            },
            other => Self::Store(other),
        }
    }
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: OrchestratorError = StoreError::NotFound {
            kind: "execution",
            id: "e-1".to_string(),
        }
        .into();
        assert!(matches!(err, OrchestratorError::NotFound { kind: "execution", .. }));
        assert_eq!(err.to_string(), "execution not found: e-1");
    }

    #[test]
    fn test_store_transition_maps_to_invalid_transition() {
        let err: OrchestratorError = StoreError::InvalidTransition {
            id: "e-1".to_string(),
            from: ExecutionStatus::Failed,
            to: ExecutionStatus::Completed,
        }
        .into();
        assert_eq!(err.to_string(), "execution e-1 cannot move from failed to completed");
    }

    #[test]
    fn test_invalid_expression_message() {
        let cron_err = crate::cron::CronParser::parse("* * *").unwrap_err();
        let err = OrchestratorError::invalid_expression("* * *", &cron_err);
        assert!(err.to_string().starts_with("invalid cron expression '* * *'"));
    }
}
