//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pipeline_orchestrator::dispatcher::{DispatchError, TaskDispatcher, TaskHandle, TaskRequest};
use pipeline_orchestrator::{
    Orchestrator, OrchestratorSettings, PipelineRegistry, PipelineSpec,
};
use pipeline_store::{
    Execution, ExecutionQuery, ExecutionStatus, ExecutionStore, LogEntry, Page, Schedule,
    ScheduleStore, StoreError, StoreResult, Stores, Transition, TransitionUpdate,
};

/// How [`RecordingDispatcher`] answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Behaviour {
    pub reject_submit: bool,
    pub submit_delay: Option<Duration>,
    pub confirm_cancel: bool,
}

/// Dispatcher that remembers every call and never runs anything.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    pub behaviour: Behaviour,
    pub submitted: Mutex<Vec<TaskRequest>>,
    pub cancelled: Mutex<Vec<TaskHandle>>,
}

impl RecordingDispatcher {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            ..Self::default()
        })
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().len()
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn submit(&self, request: TaskRequest) -> Result<TaskHandle, DispatchError> {
        if let Some(delay) = self.behaviour.submit_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behaviour.reject_submit {
            return Err(DispatchError::Queue("broker unavailable".to_string()));
        }
        let handle = TaskHandle {
            task_id: format!("task-{}", self.submitted.lock().len() + 1),
            execution_id: request.execution_id.clone(),
        };
        self.submitted.lock().push(request);
        Ok(handle)
    }

    async fn cancel(&self, handle: &TaskHandle) -> Result<bool, DispatchError> {
        self.cancelled.lock().push(handle.clone());
        Ok(self.behaviour.confirm_cancel)
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// `extract` and `clean` have no prerequisites; `report` needs both.
pub fn registry() -> PipelineRegistry {
    let registry = PipelineRegistry::new();
    registry.register(PipelineSpec::new("extract"));
    registry.register(PipelineSpec::new("clean"));
    registry.register(PipelineSpec::new("report").with_prerequisites(["extract", "clean"]));
    registry
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub stores: Stores,
    pub dispatcher: Arc<RecordingDispatcher>,
}

pub fn harness(settings: OrchestratorSettings, behaviour: Behaviour) -> Harness {
    harness_with_stores(Stores::in_memory(), settings, behaviour)
}

pub fn harness_with_stores(
    stores: Stores,
    settings: OrchestratorSettings,
    behaviour: Behaviour,
) -> Harness {
    let dispatcher = RecordingDispatcher::new(behaviour);
    let orchestrator = Orchestrator::new(
        registry(),
        stores.clone(),
        Arc::clone(&dispatcher) as Arc<dyn TaskDispatcher>,
        settings,
    );
    Harness {
        orchestrator,
        stores,
        dispatcher,
    }
}

/// Schedule store whose `update` stalls after reading its input, so a tick
/// can claim a firing while an admin edit is in flight.
pub struct SlowUpdates {
    pub inner: Arc<dyn ScheduleStore>,
    pub delay: Duration,
}

impl SlowUpdates {
    pub fn wrap(stores: Stores, delay: Duration) -> Stores {
        Stores {
            schedules: Arc::new(Self {
                inner: stores.schedules,
                delay,
            }),
            executions: stores.executions,
        }
    }
}

#[async_trait]
impl ScheduleStore for SlowUpdates {
    async fn insert(&self, schedule: Schedule) -> StoreResult<Schedule> {
        self.inner.insert(schedule).await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Schedule>> {
        self.inner.get(id).await
    }

    async fn update(&self, schedule: Schedule, reschedule: bool) -> StoreResult<Schedule> {
        tokio::time::sleep(self.delay).await;
        self.inner.update(schedule, reschedule).await
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        self.inner.delete(id).await
    }

    async fn list(&self) -> StoreResult<Vec<Schedule>> {
        self.inner.list().await
    }

    async fn list_enabled(&self) -> StoreResult<Vec<Schedule>> {
        self.inner.list_enabled().await
    }

    async fn list_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>> {
        self.inner.list_due(now).await
    }

    async fn claim(
        &self,
        id: &str,
        expected_next_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
        last_run: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        self.inner.claim(id, expected_next_run, next_run, last_run).await
    }
}

/// Execution store that refuses task ids and log lines but keeps everything
/// else working.
pub struct BrokenBookkeeping {
    pub inner: Arc<dyn ExecutionStore>,
}

impl BrokenBookkeeping {
    pub fn wrap(stores: Stores) -> Stores {
        Stores {
            schedules: stores.schedules,
            executions: Arc::new(Self {
                inner: stores.executions,
            }),
        }
    }

    fn refused() -> StoreError {
        StoreError::Corrupt("disk quota exceeded".to_string())
    }
}

#[async_trait]
impl ExecutionStore for BrokenBookkeeping {
    async fn create(&self, execution: Execution) -> StoreResult<Execution> {
        self.inner.create(execution).await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Execution>> {
        self.inner.get(id).await
    }

    async fn transition(
        &self,
        id: &str,
        to: ExecutionStatus,
        update: TransitionUpdate,
    ) -> StoreResult<Transition> {
        self.inner.transition(id, to, update).await
    }

    async fn set_task_id(&self, _id: &str, _task_id: &str) -> StoreResult<()> {
        Err(Self::refused())
    }

    async fn list(&self, query: &ExecutionQuery) -> StoreResult<Page<Execution>> {
        self.inner.list(query).await
    }

    async fn latest_for_pipeline(&self, pipeline_id: &str) -> StoreResult<Option<Execution>> {
        self.inner.latest_for_pipeline(pipeline_id).await
    }

    async fn append_log(&self, _id: &str, _line: &str) -> StoreResult<LogEntry> {
        Err(Self::refused())
    }

    async fn logs(&self, id: &str) -> StoreResult<Vec<LogEntry>> {
        self.inner.logs(id).await
    }
}
