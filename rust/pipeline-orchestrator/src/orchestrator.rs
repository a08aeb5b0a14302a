//! The orchestrator façade.
//!
//! [`Orchestrator`] owns the pipeline registry, the record stores, the task
//! dispatcher and the scheduler loop. It is cheap to clone; every clone
//! drives the same instance.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_store::{
    Execution, ExecutionQuery, ExecutionStatus, LogEntry, Page, Parameters, Schedule, Stores,
    Transition, TransitionUpdate,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cron;
use crate::dependency::DependencyResolver;
use crate::dispatcher::{StatusDetail, StatusReceiver, TaskDispatcher, TaskHandle, TaskRequest};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::pipeline::{PipelineRegistry, PipelineSpec};
use crate::retry::RetryPolicy;
use crate::scheduler::{
    ScheduleOutcome, ScheduleReport, SchedulerLoop, SchedulerStatus, Tick, TickSummary,
};

/// Capacity of the execution event broadcast.
const EVENT_CAPACITY: usize = 256;

/// Runtime knobs, usually built by
/// [`AppConfig::orchestrator_settings`](crate::config::AppConfig::orchestrator_settings).
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub interval: Duration,
    pub run_immediately: bool,
    pub tick_timeout: Duration,
    pub dependency_timeout: Duration,
    /// Move `next_run` forward when prerequisites block a firing, instead of
    /// re-checking the same firing on the next tick.
    pub advance_on_dependency_skip: bool,
    pub dispatch_timeout: Duration,
    pub cancel_grace: Duration,
    pub retry: RetryPolicy,
    pub dependency_staleness_secs: Option<u64>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            run_immediately: false,
            tick_timeout: Duration::from_secs(300),
            dependency_timeout: Duration::from_secs(30),
            advance_on_dependency_skip: true,
            dispatch_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            dependency_staleness_secs: None,
        }
    }
}

/// Published for every created execution and every applied status change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "execution", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Created(Execution),
    StatusChanged(Execution),
}

impl ExecutionEvent {
    pub fn execution(&self) -> &Execution {
        match self {
            Self::Created(execution) | Self::StatusChanged(execution) => execution,
        }
    }
}

/// Input to [`Orchestrator::create_schedule`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSchedule {
    pub pipeline_id: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub parameters: Option<Parameters>,
    pub description: Option<String>,
    pub max_attempts: Option<u32>,
    pub dependency_staleness_secs: Option<u64>,
}

impl CreateSchedule {
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            cron_expression: cron_expression.into(),
            enabled: true,
            parameters: None,
            description: None,
            max_attempts: None,
            dependency_staleness_secs: None,
        }
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Parameters from a JSON object. Nested values are rejected.
    pub fn with_json_parameters(mut self, parameters: serde_json::Value) -> OrchestratorResult<Self> {
        self.parameters = Some(pipeline_store::parameters_from_json(parameters)?);
        Ok(self)
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn with_dependency_staleness(mut self, secs: u64) -> Self {
        self.dependency_staleness_secs = Some(secs);
        self
    }
}

/// Changes for [`Orchestrator::update_schedule`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulePatch {
    pub cron_expression: Option<String>,
    pub enabled: Option<bool>,
    pub parameters: Option<Option<Parameters>>,
    pub description: Option<Option<String>>,
    pub max_attempts: Option<Option<u32>>,
    pub dependency_staleness_secs: Option<Option<u64>>,
}

impl SchedulePatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    #[must_use]
    pub fn parameters(mut self, parameters: Option<Parameters>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    #[must_use]
    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = Some(description);
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn dependency_staleness(mut self, secs: Option<u64>) -> Self {
        self.dependency_staleness_secs = Some(secs);
        self
    }
}

struct Inner {
    registry: PipelineRegistry,
    stores: Stores,
    dispatcher: Arc<dyn TaskDispatcher>,
    resolver: DependencyResolver,
    settings: OrchestratorSettings,
    events: broadcast::Sender<ExecutionEvent>,
    scheduler: SchedulerLoop,
}

/// Schedules pipeline runs, dispatches them and tracks their lifecycle.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        registry: PipelineRegistry,
        stores: Stores,
        dispatcher: Arc<dyn TaskDispatcher>,
        settings: OrchestratorSettings,
    ) -> Self {
        let resolver = DependencyResolver::new(
            Arc::clone(&stores.executions),
            settings.dependency_staleness_secs,
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let scheduler = SchedulerLoop::new(settings.tick_timeout);
        Self {
            inner: Arc::new(Inner {
                registry,
                stores,
                dispatcher,
                resolver,
                settings,
                events,
                scheduler,
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    // ----- pipelines -------------------------------------------------------

    /// Register or replace a pipeline. Returns `true` when it was new.
    pub fn register_pipeline(&self, spec: PipelineSpec) -> bool {
        let id = spec.id.clone();
        let added = self.inner.registry.register(spec);
        tracing::debug!(pipeline_id = %id, added, "Pipeline registered");
        added
    }

    pub fn pipeline(&self, id: &str) -> Option<PipelineSpec> {
        self.inner.registry.get(id)
    }

    pub fn list_pipelines(&self) -> Vec<PipelineSpec> {
        self.inner.registry.list()
    }

    // ----- schedules -------------------------------------------------------

    pub async fn create_schedule(&self, request: CreateSchedule) -> OrchestratorResult<Schedule> {
        let now = Utc::now();
        let next_run = Self::next_trigger(&request.cron_expression, now)?;
        if !self.inner.registry.contains(&request.pipeline_id) {
            return Err(OrchestratorError::UnknownPipeline(request.pipeline_id));
        }

        let mut schedule = Schedule::new(request.pipeline_id, request.cron_expression);
        schedule.enabled = request.enabled;
        schedule.parameters = request.parameters;
        schedule.description = request.description;
        schedule.max_attempts = request.max_attempts;
        schedule.dependency_staleness_secs = request.dependency_staleness_secs;
        schedule.next_run = request.enabled.then_some(next_run);

        let schedule = self.inner.stores.schedules.insert(schedule).await?;
        tracing::info!(
            schedule_id = %schedule.id,
            pipeline_id = %schedule.pipeline_id,
            cron = %schedule.cron_expression,
            next_run = ?schedule.next_run,
            "Schedule created"
        );
        Ok(schedule)
    }

    pub async fn update_schedule(&self, id: &str, patch: SchedulePatch) -> OrchestratorResult<Schedule> {
        let mut schedule = self.get_schedule(id).await?;
        let now = Utc::now();

        let mut reschedule = false;
        if let Some(expression) = patch.cron_expression {
            Self::next_trigger(&expression, now)?;
            reschedule |= expression != schedule.cron_expression;
            schedule.cron_expression = expression;
        }
        if let Some(enabled) = patch.enabled {
            reschedule |= enabled != schedule.enabled;
            schedule.enabled = enabled;
        }
        if let Some(parameters) = patch.parameters {
            schedule.parameters = parameters;
        }
        if let Some(description) = patch.description {
            schedule.description = description;
        }
        if let Some(max_attempts) = patch.max_attempts {
            schedule.max_attempts = max_attempts;
        }
        if let Some(staleness) = patch.dependency_staleness_secs {
            schedule.dependency_staleness_secs = staleness;
        }

        if reschedule {
            schedule.next_run = if schedule.enabled {
                Some(Self::next_trigger(&schedule.cron_expression, now)?)
            } else {
                None
            };
        }
        schedule.updated_at = now;

        let schedule = self.inner.stores.schedules.update(schedule, reschedule).await?;
        tracing::info!(
            schedule_id = %schedule.id,
            enabled = schedule.enabled,
            next_run = ?schedule.next_run,
            "Schedule updated"
        );
        Ok(schedule)
    }

    /// Delete a schedule. Its executions are kept.
    pub async fn delete_schedule(&self, id: &str) -> OrchestratorResult<()> {
        if !self.inner.stores.schedules.delete(id).await? {
            return Err(OrchestratorError::schedule_not_found(id));
        }
        tracing::info!(schedule_id = %id, "Schedule deleted");
        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> OrchestratorResult<Schedule> {
        self.inner
            .stores
            .schedules
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::schedule_not_found(id))
    }

    pub async fn list_schedules(&self) -> OrchestratorResult<Vec<Schedule>> {
        Ok(self.inner.stores.schedules.list().await?)
    }

    fn next_trigger(expression: &str, after: DateTime<Utc>) -> OrchestratorResult<DateTime<Utc>> {
        cron::next_trigger(expression, after)
            .map_err(|e| OrchestratorError::invalid_expression(expression, &e))
    }

    // ----- executions ------------------------------------------------------

    /// Start the first attempt of a schedule firing.
    ///
    /// The returned execution is `failed` when it could not be enqueued.
    pub async fn dispatch(&self, schedule: &Schedule) -> OrchestratorResult<Execution> {
        self.launch(Execution::scheduled(schedule)).await
    }

    /// Run a pipeline now, outside any schedule and without checking
    /// prerequisites.
    pub async fn run_pipeline_now(
        &self,
        pipeline_id: &str,
        parameters: Parameters,
    ) -> OrchestratorResult<Execution> {
        if !self.inner.registry.contains(pipeline_id) {
            return Err(OrchestratorError::UnknownPipeline(pipeline_id.to_string()));
        }
        self.launch(Execution::manual(pipeline_id, parameters)).await
    }

    /// Create the execution and hand it to the dispatcher.
    ///
    /// Runs on its own task: once the record exists it always ends up
    /// dispatched or `failed`, even if the caller stops waiting.
    async fn launch(&self, execution: Execution) -> OrchestratorResult<Execution> {
        let this = self.clone();
        tokio::spawn(async move { this.create_and_submit(execution).await })
            .await
            .map_err(|e| OrchestratorError::Other(anyhow::Error::new(e).context("launch task failed")))?
    }

    async fn create_and_submit(&self, execution: Execution) -> OrchestratorResult<Execution> {
        let executions = &self.inner.stores.executions;
        let mut execution = executions.create(execution).await?;
        self.emit(ExecutionEvent::Created(execution.clone()));

        let timeout = self.inner.settings.dispatch_timeout;
        let request = TaskRequest::for_execution(&execution);
        let failure = match tokio::time::timeout(timeout, self.inner.dispatcher.submit(request)).await {
            Ok(Ok(handle)) => {
                // The task is enqueued; bookkeeping failures must not report it as lost.
                if let Err(e) = executions.set_task_id(&execution.id, &handle.task_id).await {
                    tracing::error!(
                        execution_id = %execution.id,
                        task_id = %handle.task_id,
                        error = %e,
                        "Failed to record task id"
                    );
                }
                let line = format!("dispatched to {} as task {}", self.inner.dispatcher.name(), handle.task_id);
                self.append_log_quietly(&execution.id, &line).await;
                tracing::info!(
                    execution_id = %execution.id,
                    pipeline_id = %execution.pipeline_id,
                    attempt = execution.attempt,
                    correlation_id = %execution.correlation_id,
                    task_id = %handle.task_id,
                    "Execution dispatched"
                );
                execution.task_id = Some(handle.task_id);
                return Ok(execution);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("dispatcher did not respond within {timeout:?}"),
        };

        tracing::warn!(
            execution_id = %execution.id,
            pipeline_id = %execution.pipeline_id,
            error = %failure,
            "Failed to enqueue execution"
        );
        let error = OrchestratorError::EnqueueFailure(failure).to_string();
        let transition = executions
            .transition(
                &execution.id,
                ExecutionStatus::Failed,
                TransitionUpdate::now().with_error(error.clone()),
            )
            .await?;
        self.append_log_quietly(&execution.id, &error).await;
        let execution = transition.into_execution();
        self.emit(ExecutionEvent::StatusChanged(execution.clone()));
        Ok(execution)
    }

    async fn append_log_quietly(&self, execution_id: &str, line: &str) {
        if let Err(e) = self.inner.stores.executions.append_log(execution_id, line).await {
            tracing::warn!(execution_id, error = %e, "Failed to append execution log");
        }
    }

    /// Apply a worker status report.
    ///
    /// A repeated report is ignored. A report that would move the status
    /// backwards or out of a terminal state fails with `InvalidTransition`
    /// and changes nothing. An applied `failed` starts the next attempt when
    /// the retry policy allows it.
    pub async fn on_status_update(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        detail: StatusDetail,
    ) -> OrchestratorResult<Execution> {
        let executions = &self.inner.stores.executions;

        let mut update = TransitionUpdate::now();
        if let Some(error) = &detail.error {
            update = update.with_error(error.clone());
        }
        if let Some(log_ref) = &detail.log_ref {
            update = update.with_log_ref(log_ref.clone());
        }

        let execution = match executions.transition(execution_id, status, update).await? {
            Transition::Duplicate(execution) => {
                tracing::debug!(execution_id, %status, "Duplicate status report ignored");
                return Ok(execution);
            }
            Transition::Applied(execution) => execution,
        };

        if let Some(message) = &detail.message {
            executions.append_log(execution_id, message).await?;
        }
        if let Some(error) = &detail.error {
            executions.append_log(execution_id, &format!("error: {error}")).await?;
        }
        tracing::info!(
            execution_id,
            pipeline_id = %execution.pipeline_id,
            attempt = execution.attempt,
            %status,
            "Execution status updated"
        );
        self.emit(ExecutionEvent::StatusChanged(execution.clone()));

        if status == ExecutionStatus::Failed {
            if let Err(e) = self.retry(&execution).await {
                tracing::error!(
                    execution_id,
                    correlation_id = %execution.correlation_id,
                    error = %e,
                    "Failed to start retry"
                );
            }
        }
        Ok(execution)
    }

    async fn retry(&self, failed: &Execution) -> OrchestratorResult<()> {
        let max_attempts = match &failed.schedule_id {
            Some(schedule_id) => self
                .inner
                .stores
                .schedules
                .get(schedule_id)
                .await?
                .and_then(|schedule| schedule.max_attempts),
            None => None,
        };
        let policy = self.inner.settings.retry.with_override(max_attempts);
        if !policy.should_retry(failed.attempt) {
            if policy.max_attempts > 1 {
                tracing::info!(
                    execution_id = %failed.id,
                    correlation_id = %failed.correlation_id,
                    attempts = failed.attempt,
                    "Retries exhausted"
                );
            }
            return Ok(());
        }

        let next = failed.next_attempt();
        let delay = policy.backoff.delay(failed.attempt);
        tracing::info!(
            execution_id = %failed.id,
            correlation_id = %failed.correlation_id,
            next_attempt = next.attempt,
            delay_secs = delay.as_secs(),
            backoff = policy.backoff.kind_str(),
            "Scheduling retry"
        );
        if delay.is_zero() {
            self.launch(next).await?;
        } else {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = this.launch(next).await {
                    tracing::error!(error = %e, "Delayed retry failed");
                }
            });
        }
        Ok(())
    }

    /// Ask the dispatcher to stop an execution.
    ///
    /// The execution is marked `cancelled` at once when the dispatcher
    /// confirms or the run was never handed out. Otherwise it is marked after
    /// the cancel grace period unless it finishes first.
    pub async fn cancel_execution(&self, id: &str) -> OrchestratorResult<Execution> {
        let execution = self.get_execution(id).await?;
        if execution.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                execution_id: execution.id,
                from: execution.status,
                to: ExecutionStatus::Cancelled,
            });
        }

        let Some(task_id) = execution.task_id.clone() else {
            return self.mark_cancelled(id, "cancelled before dispatch").await;
        };
        let executions = &self.inner.stores.executions;
        executions.append_log(id, "cancellation requested").await?;

        let handle = TaskHandle {
            task_id,
            execution_id: id.to_string(),
        };
        let timeout = self.inner.settings.dispatch_timeout;
        let confirmed = match tokio::time::timeout(timeout, self.inner.dispatcher.cancel(&handle)).await {
            Ok(Ok(confirmed)) => confirmed,
            Ok(Err(e)) => {
                tracing::warn!(execution_id = %id, error = %e, "Dispatcher cancel failed");
                false
            }
            Err(_) => {
                tracing::warn!(execution_id = %id, "Dispatcher cancel timed out");
                false
            }
        };
        if confirmed {
            return self.mark_cancelled(id, "cancelled").await;
        }

        let grace = self.inner.settings.cancel_grace;
        let this = self.clone();
        let execution_id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match this.mark_cancelled(&execution_id, "cancelled after grace period").await {
                Ok(_) => {}
                Err(OrchestratorError::InvalidTransition { from, .. }) => {
                    tracing::debug!(
                        execution_id = %execution_id,
                        %from,
                        "Execution finished before cancel grace expired"
                    );
                }
                Err(e) => {
                    tracing::warn!(execution_id = %execution_id, error = %e, "Failed to record cancellation");
                }
            }
        });
        self.get_execution(id).await
    }

    async fn mark_cancelled(&self, id: &str, reason: &str) -> OrchestratorResult<Execution> {
        let executions = &self.inner.stores.executions;
        let transition = executions
            .transition(id, ExecutionStatus::Cancelled, TransitionUpdate::now())
            .await?;
        if transition.is_applied() {
            executions.append_log(id, reason).await?;
            tracing::info!(execution_id = %id, reason, "Execution cancelled");
            self.emit(ExecutionEvent::StatusChanged(transition.execution().clone()));
        }
        Ok(transition.into_execution())
    }

    pub async fn get_execution(&self, id: &str) -> OrchestratorResult<Execution> {
        self.inner
            .stores
            .executions
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::execution_not_found(id))
    }

    pub async fn list_executions(&self, query: &ExecutionQuery) -> OrchestratorResult<Page<Execution>> {
        Ok(self.inner.stores.executions.list(query).await?)
    }

    pub async fn execution_logs(&self, id: &str) -> OrchestratorResult<Vec<LogEntry>> {
        Ok(self.inner.stores.executions.logs(id).await?)
    }

    pub async fn append_execution_log(&self, id: &str, line: &str) -> OrchestratorResult<LogEntry> {
        Ok(self.inner.stores.executions.append_log(id, line).await?)
    }

    // ----- events ----------------------------------------------------------

    /// Stream of execution events. Slow receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ExecutionEvent) {
        // Err only means nobody is subscribed.
        let _ = self.inner.events.send(event);
    }

    /// Feed dispatcher status events into [`Self::on_status_update`] until
    /// the channel closes.
    pub fn listen(&self, mut events: StatusReceiver) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = this
                    .on_status_update(&event.execution_id, event.status, event.detail)
                    .await
                {
                    tracing::warn!(
                        execution_id = %event.execution_id,
                        status = %event.status,
                        error = %e,
                        "Status report rejected"
                    );
                }
            }
            tracing::debug!("Status channel closed");
        })
    }

    // ----- scheduler -------------------------------------------------------

    /// Start the scheduler loop. Returns `false` when it is already running.
    pub fn start(&self, interval: Duration, run_immediately: bool) -> bool {
        let ticker: Arc<dyn Tick> = Arc::new(self.clone());
        self.inner.scheduler.start(ticker, interval, run_immediately)
    }

    /// Stop the scheduler loop after its in-flight tick. Idempotent.
    pub async fn stop(&self) {
        self.inner.scheduler.stop().await;
    }

    pub async fn run_once(&self, force: bool) -> OrchestratorResult<TickSummary> {
        self.run_once_at(Utc::now(), force).await
    }

    /// One tick evaluated as if the time were `now`.
    pub async fn run_once_at(&self, now: DateTime<Utc>, force: bool) -> OrchestratorResult<TickSummary> {
        self.inner.scheduler.run_once(self, now, force).await
    }

    pub fn status(&self) -> SchedulerStatus {
        self.inner.scheduler.status()
    }

    fn is_due(schedule: &Schedule, now: DateTime<Utc>) -> OrchestratorResult<bool> {
        match schedule.next_run {
            Some(next_run) => Ok(next_run <= now),
            None => {
                let reference = schedule.last_run.unwrap_or(schedule.updated_at);
                cron::is_due(&schedule.cron_expression, now, reference)
                    .map_err(|e| OrchestratorError::invalid_expression(&schedule.cron_expression, &e))
            }
        }
    }

    /// `None` when the schedule is not due.
    async fn evaluate(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        force: bool,
    ) -> OrchestratorResult<Option<ScheduleOutcome>> {
        if !force && !Self::is_due(schedule, now)? {
            return Ok(None);
        }

        let pipeline = self
            .inner
            .registry
            .get(&schedule.pipeline_id)
            .ok_or_else(|| OrchestratorError::UnknownPipeline(schedule.pipeline_id.clone()))?;
        let next_run = Some(Self::next_trigger(&schedule.cron_expression, now)?);

        let timeout = self.inner.settings.dependency_timeout;
        let resolving = self.inner.resolver.check(
            &pipeline.prerequisites,
            schedule.dependency_staleness_secs,
            now,
        );
        let check = match tokio::time::timeout(timeout, resolving).await {
            Ok(check) => check?,
            Err(_) => {
                return Err(OrchestratorError::Timeout {
                    operation: "dependency check",
                    after: timeout,
                });
            }
        };

        let schedules = &self.inner.stores.schedules;
        if !check.is_satisfied() {
            let advanced = self.inner.settings.advance_on_dependency_skip
                && schedules.claim(&schedule.id, schedule.next_run, next_run, None).await?;
            let unmet = check
                .unmet
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            tracing::info!(
                schedule_id = %schedule.id,
                pipeline_id = %schedule.pipeline_id,
                advanced,
                unmet = %unmet,
                "Prerequisites not met, skipping run"
            );
            return Ok(Some(ScheduleOutcome::DependencyUnsatisfied {
                unmet: check.unmet,
                advanced,
            }));
        }

        if !schedules
            .claim(&schedule.id, schedule.next_run, next_run, Some(now))
            .await?
        {
            tracing::debug!(schedule_id = %schedule.id, "Firing already claimed");
            return Ok(Some(ScheduleOutcome::Superseded));
        }

        let execution = self.dispatch(schedule).await?;
        Ok(Some(if execution.status == ExecutionStatus::Failed {
            ScheduleOutcome::EnqueueFailed {
                error: execution.error.unwrap_or_default(),
                execution_id: execution.id,
            }
        } else {
            ScheduleOutcome::Dispatched {
                execution_id: execution.id,
            }
        }))
    }
}

#[async_trait]
impl Tick for Orchestrator {
    async fn tick(&self, now: DateTime<Utc>, force: bool) -> OrchestratorResult<TickSummary> {
        let schedules = self.inner.stores.schedules.list_enabled().await?;
        let mut summary = TickSummary::new(now, force);
        summary.evaluated = schedules.len();

        for schedule in schedules {
            let (schedule_id, pipeline_id) = (schedule.id.clone(), schedule.pipeline_id.clone());

            // Each evaluation runs to completion on its own task, so a tick
            // timeout can stop waiting but never strands a claimed firing.
            let this = self.clone();
            let evaluation = tokio::spawn(async move { this.evaluate(&schedule, now, force).await });
            let result = match evaluation.await {
                Ok(result) => result,
                Err(e) => Err(OrchestratorError::Other(
                    anyhow::Error::new(e).context("schedule evaluation task failed"),
                )),
            };

            let outcome = match result {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        schedule_id = %schedule_id,
                        pipeline_id = %pipeline_id,
                        error = %e,
                        "Schedule evaluation failed"
                    );
                    ScheduleOutcome::Error { error: e.to_string() }
                }
            };
            summary.record(ScheduleReport {
                schedule_id,
                pipeline_id,
                outcome,
            });
        }

        let summary = summary.finish();
        tracing::info!(
            evaluated = summary.evaluated,
            dispatched = summary.dispatched,
            skipped = summary.skipped,
            failed = summary.failed,
            forced = force,
            "Tick complete"
        );
        Ok(summary)
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipelines", &self.inner.registry.len())
            .field("dispatcher", &self.inner.dispatcher.name())
            .field("settings", &self.inner.settings)
            .field("scheduler", &self.inner.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchError;
    use pipeline_store::ParamValue;

    /// Accepts everything and never reports back.
    struct Sink;

    #[async_trait]
    impl TaskDispatcher for Sink {
        async fn submit(&self, request: TaskRequest) -> Result<TaskHandle, DispatchError> {
            Ok(TaskHandle {
                task_id: format!("task-{}", request.execution_id),
                execution_id: request.execution_id,
            })
        }

        async fn cancel(&self, _handle: &TaskHandle) -> Result<bool, DispatchError> {
            Ok(false)
        }

        fn name(&self) -> &'static str {
            "sink"
        }
    }

    fn orchestrator() -> Orchestrator {
        let registry = PipelineRegistry::new();
        registry.register(PipelineSpec::new("daily-sales"));
        Orchestrator::new(
            registry,
            Stores::in_memory(),
            Arc::new(Sink),
            OrchestratorSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_create_schedule_computes_next_run() {
        let orchestrator = orchestrator();
        let schedule = orchestrator
            .create_schedule(CreateSchedule::new("daily-sales", "0 2 * * *"))
            .await
            .unwrap();
        let next = schedule.next_run.unwrap();
        assert!(next > Utc::now());
        assert_eq!(next.format("%H:%M").to_string(), "02:00");

        let disabled = orchestrator
            .create_schedule(CreateSchedule::new("daily-sales", "0 2 * * *").disabled())
            .await
            .unwrap();
        assert!(disabled.next_run.is_none());
    }

    #[tokio::test]
    async fn test_create_schedule_rejects_bad_input() {
        let orchestrator = orchestrator();

        let err = orchestrator
            .create_schedule(CreateSchedule::new("daily-sales", "61 * * * *"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidExpression { .. }));

        let err = orchestrator
            .create_schedule(CreateSchedule::new("daily-sales", "0 0 30 2 *"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidExpression { .. }));

        let err = orchestrator
            .create_schedule(CreateSchedule::new("unknown", "0 2 * * *"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownPipeline(_)));

        assert!(orchestrator.list_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_parameters_are_validated() {
        let ok = CreateSchedule::new("daily-sales", "0 2 * * *")
            .with_json_parameters(serde_json::json!({"region": "eu", "full": true}))
            .unwrap();
        assert_eq!(
            ok.parameters.unwrap().get("region"),
            Some(&ParamValue::from("eu"))
        );

        let err = CreateSchedule::new("daily-sales", "0 2 * * *")
            .with_json_parameters(serde_json::json!({"nested": {"a": 1}}))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_update_schedule_recomputes_next_run() {
        let orchestrator = orchestrator();
        let schedule = orchestrator
            .create_schedule(CreateSchedule::new("daily-sales", "0 2 * * *"))
            .await
            .unwrap();

        let updated = orchestrator
            .update_schedule(&schedule.id, SchedulePatch::new().cron("30 4 * * *"))
            .await
            .unwrap();
        assert_eq!(
            updated.next_run.unwrap().format("%H:%M").to_string(),
            "04:30"
        );

        let paused = orchestrator
            .update_schedule(&schedule.id, SchedulePatch::new().enabled(false))
            .await
            .unwrap();
        assert!(paused.next_run.is_none());

        let described = orchestrator
            .update_schedule(
                &schedule.id,
                SchedulePatch::new().description(Some("nightly".to_string())),
            )
            .await
            .unwrap();
        assert!(described.next_run.is_none());
        assert_eq!(described.description.as_deref(), Some("nightly"));

        let err = orchestrator
            .update_schedule(&schedule.id, SchedulePatch::new().cron("bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidExpression { .. }));

        let err = orchestrator
            .update_schedule("missing", SchedulePatch::new().enabled(true))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { kind: "schedule", .. }));
    }

    #[tokio::test]
    async fn test_delete_schedule() {
        let orchestrator = orchestrator();
        let schedule = orchestrator
            .create_schedule(CreateSchedule::new("daily-sales", "* * * * *"))
            .await
            .unwrap();

        orchestrator.delete_schedule(&schedule.id).await.unwrap();
        let err = orchestrator.delete_schedule(&schedule.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let orchestrator = orchestrator();
        let mut events = orchestrator.subscribe();

        let execution = orchestrator
            .run_pipeline_now("daily-sales", Parameters::new())
            .await
            .unwrap();
        orchestrator
            .on_status_update(&execution.id, ExecutionStatus::Running, StatusDetail::default())
            .await
            .unwrap();

        let created = events.recv().await.unwrap();
        assert!(matches!(created, ExecutionEvent::Created(_)));
        assert_eq!(created.execution().id, execution.id);

        let changed = events.recv().await.unwrap();
        assert_eq!(changed.execution().status, ExecutionStatus::Running);
    }

    #[test]
    fn test_is_due_falls_back_to_cron() {
        let mut schedule = Schedule::new("daily-sales", "*/5 * * * *");
        let base = schedule.updated_at;
        assert!(!Orchestrator::is_due(&schedule, base).unwrap());
        assert!(Orchestrator::is_due(&schedule, base + chrono::TimeDelta::minutes(6)).unwrap());

        schedule.next_run = Some(base + chrono::TimeDelta::hours(1));
        assert!(!Orchestrator::is_due(&schedule, base + chrono::TimeDelta::minutes(6)).unwrap());
    }
}
