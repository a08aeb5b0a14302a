//! In-process worker pool.
//!
//! Each submitted run becomes a tokio task executing the [`PipelineRunner`]
//! registered for its pipeline. A semaphore bounds how many runs execute at
//! once; excess runs wait in `pending` until a slot frees up.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use pipeline_store::{ExecutionStatus, Parameters};
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;

use super::{
    DispatchError, StatusDetail, StatusEvent, StatusSender, TaskDispatcher, TaskHandle,
    TaskRequest,
};

/// What a runner sees of the execution it runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub execution_id: String,
    pub pipeline_id: String,
    pub correlation_id: String,
    pub attempt: u32,
    pub parameters: Parameters,
}

/// Result of a successful run.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Appended to the execution log.
    pub message: Option<String>,
    /// Reference to logs kept by the runner.
    pub log_ref: Option<String>,
}

/// Runs one pipeline to completion.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(&self, ctx: &RunContext) -> anyhow::Result<RunOutput>;
}

#[derive(Debug)]
struct RunningTask {
    execution_id: String,
    abort: AbortHandle,
}

/// In-process [`TaskDispatcher`].
#[derive(Clone)]
pub struct LocalDispatcher {
    runners: Arc<RwLock<HashMap<String, Arc<dyn PipelineRunner>>>>,
    fallback: Option<Arc<dyn PipelineRunner>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    tasks: Arc<Mutex<HashMap<String, RunningTask>>>,
    events: StatusSender,
}

impl LocalDispatcher {
    /// Create a pool reporting to `events` that runs at most `max_concurrent` pipelines at once.
    #[must_use]
    pub fn new(events: StatusSender, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            runners: Arc::new(RwLock::new(HashMap::new())),
            fallback: None,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Runner used for pipelines without a dedicated one.
    #[must_use]
    pub fn with_fallback_runner(mut self, runner: Arc<dyn PipelineRunner>) -> Self {
        self.fallback = Some(runner);
        self
    }

    pub fn register_runner(&self, pipeline_id: impl Into<String>, runner: Arc<dyn PipelineRunner>) {
        self.runners.write().insert(pipeline_id.into(), runner);
    }

    /// Runs submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().len()
    }

    fn runner_for(&self, pipeline_id: &str) -> Option<Arc<dyn PipelineRunner>> {
        self.runners
            .read()
            .get(pipeline_id)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    fn report(events: &StatusSender, event: StatusEvent) {
        if events.send(event).is_err() {
            tracing::warn!("Status channel closed, dropping worker report");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[async_trait]
impl TaskDispatcher for LocalDispatcher {
    async fn submit(&self, request: TaskRequest) -> Result<TaskHandle, DispatchError> {
        if self.events.is_closed() {
            return Err(DispatchError::Closed);
        }
        let runner = self
            .runner_for(&request.pipeline_id)
            .ok_or_else(|| DispatchError::UnknownPipeline(request.pipeline_id.clone()))?;

        let task_id = uuid::Uuid::new_v4().to_string();
        let handle = TaskHandle {
            task_id: task_id.clone(),
            execution_id: request.execution_id.clone(),
        };

        let ctx = RunContext {
            execution_id: request.execution_id,
            pipeline_id: request.pipeline_id,
            correlation_id: request.correlation_id,
            attempt: request.attempt,
            parameters: request.parameters,
        };
        let permits = Arc::clone(&self.permits);
        let tasks = Arc::clone(&self.tasks);
        let events = self.events.clone();
        let worker_task_id = task_id.clone();

        // Hold the map lock across spawn so the task cannot deregister
        // itself before it is registered.
        let mut running = self.tasks.lock();
        let join = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tasks.lock().remove(&worker_task_id);
                return;
            };

            let event = |status| StatusEvent::new(&ctx.execution_id, status).with_task(&worker_task_id);
            Self::report(&events, event(ExecutionStatus::Running));

            tracing::debug!(
                execution_id = %ctx.execution_id,
                pipeline_id = %ctx.pipeline_id,
                attempt = ctx.attempt,
                "Local runner started"
            );
            let result = AssertUnwindSafe(runner.run(&ctx)).catch_unwind().await;
            tasks.lock().remove(&worker_task_id);

            match result {
                Ok(Ok(output)) => {
                    let detail = StatusDetail {
                        message: output.message,
                        error: None,
                        log_ref: output.log_ref,
                    };
                    Self::report(&events, event(ExecutionStatus::Completed).with_detail(detail));
                }
                Ok(Err(e)) => {
                    Self::report(
                        &events,
                        event(ExecutionStatus::Failed).with_detail(StatusDetail::error(format!("{e:#}"))),
                    );
                }
                Err(panic) => {
                    let message = format!("runner panicked: {}", panic_message(panic.as_ref()));
                    tracing::error!(
                        execution_id = %ctx.execution_id,
                        pipeline_id = %ctx.pipeline_id,
                        error = %message,
                        "Local runner panicked"
                    );
                    Self::report(&events, event(ExecutionStatus::Failed).with_detail(StatusDetail::error(message)));
                }
            }
        });
        running.insert(
            task_id,
            RunningTask {
                execution_id: handle.execution_id.clone(),
                abort: join.abort_handle(),
            },
        );
        drop(running);

        Ok(handle)
    }

    async fn cancel(&self, handle: &TaskHandle) -> Result<bool, DispatchError> {
        let Some(task) = self.tasks.lock().remove(&handle.task_id) else {
            return Ok(false);
        };
        task.abort.abort();

        tracing::info!(
            execution_id = %task.execution_id,
            task_id = %handle.task_id,
            "Local run aborted"
        );
        Self::report(
            &self.events,
            StatusEvent::new(&task.execution_id, ExecutionStatus::Cancelled)
                .with_task(&handle.task_id)
                .with_detail(StatusDetail::message("cancelled by request")),
        );
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

impl fmt::Debug for LocalDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDispatcher")
            .field("runners", &self.runners.read().len())
            .field("max_concurrent", &self.max_concurrent)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
