//! Task dispatch to pipeline workers.
//!
//! A [`TaskDispatcher`] hands a run to some worker pool and returns a
//! [`TaskHandle`]. Workers report back through [`StatusEvent`]s on the
//! channel created by [`status_channel`]; the orchestrator consumes that
//! channel with [`Orchestrator::listen`](crate::Orchestrator::listen).
//! Events may arrive more than once.

pub mod command;
pub mod local;
pub mod redis_queue;

use async_trait::async_trait;
use pipeline_store::{Execution, ExecutionStatus, Parameters};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use command::CommandRunner;
pub use local::{LocalDispatcher, PipelineRunner, RunContext, RunOutput};
pub use redis_queue::RedisQueueDispatcher;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no runner registered for pipeline {0}")]
    UnknownPipeline(String),

    #[error("dispatcher is shut down")]
    Closed,

    #[error("queue error: {0}")]
    Queue(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// A run to hand to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub execution_id: String,
    pub pipeline_id: String,
    pub correlation_id: String,
    pub attempt: u32,
    pub parameters: Parameters,
}

impl TaskRequest {
    #[must_use]
    pub fn for_execution(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id.clone(),
            pipeline_id: execution.pipeline_id.clone(),
            correlation_id: execution.correlation_id.clone(),
            attempt: execution.attempt,
            parameters: execution.parameters.clone(),
        }
    }
}

/// Dispatcher reference to a submitted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
    pub execution_id: String,
}

/// Extra information attached to a status report.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusDetail {
    /// Appended to the execution log.
    #[serde(default)]
    pub message: Option<String>,
    /// Recorded as the execution error.
    #[serde(default)]
    pub error: Option<String>,
    /// Reference to logs kept by the worker.
    #[serde(default)]
    pub log_ref: Option<String>,
}

impl StatusDetail {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_log_ref(mut self, log_ref: impl Into<String>) -> Self {
        self.log_ref = Some(log_ref.into());
        self
    }
}

/// A worker's report about one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub execution_id: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub detail: StatusDetail,
}

impl StatusEvent {
    #[must_use]
    pub fn new(execution_id: impl Into<String>, status: ExecutionStatus) -> Self {
        Self {
            execution_id: execution_id.into(),
            task_id: None,
            status,
            detail: StatusDetail::default(),
        }
    }

    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: StatusDetail) -> Self {
        self.detail = detail;
        self
    }
}

pub type StatusSender = mpsc::UnboundedSender<StatusEvent>;
pub type StatusReceiver = mpsc::UnboundedReceiver<StatusEvent>;

/// Channel carrying worker status reports to the orchestrator.
#[must_use]
pub fn status_channel() -> (StatusSender, StatusReceiver) {
    mpsc::unbounded_channel()
}

/// Submits pipeline runs to a worker pool.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Enqueue a run. An error means nothing was enqueued.
    async fn submit(&self, request: TaskRequest) -> Result<TaskHandle, DispatchError>;

    /// Ask the worker to stop.
    ///
    /// Returns `true` when the dispatcher confirms the run is stopped,
    /// `false` when the request was only forwarded.
    async fn cancel(&self, handle: &TaskHandle) -> Result<bool, DispatchError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
