//! Durable schedule and execution records for the pipeline orchestrator.
//!
//! This crate provides:
//! - The [`Schedule`] and [`Execution`] records and their status rules
//! - The [`ScheduleStore`] and [`ExecutionStore`] traits
//! - In-memory stores for tests and single-process use
//! - `SQLite` stores for durable deployments
//!
//! # Usage
//!
//! ```rust,ignore
//! use pipeline_store::Stores;
//!
//! let stores = Stores::sqlite("./pipeline-orchestrator.db").await?;
//! let due = stores.schedules.list_due(chrono::Utc::now()).await?;
//! ```
//!
//! Both stores enforce their own atomicity: [`ScheduleStore::claim`] is a
//! compare-and-swap on `next_run` and [`ExecutionStore::transition`] only
//! moves a status forward, so concurrent writers cannot corrupt either record.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod error;
pub mod memory;
pub mod model;
pub mod sqlite;

pub use error::{ParameterError, StoreError, StoreResult};
pub use memory::{InMemoryExecutionStore, InMemoryScheduleStore};
pub use model::{
    parameters_from_json, Execution, ExecutionQuery, ExecutionStatus, LogEntry, Page, ParamValue,
    Parameters, Schedule, Transition, TransitionUpdate, Trigger, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub use sqlite::{SqliteExecutionStore, SqliteScheduleStore};

/// Persistent schedules keyed by id.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert a new schedule. Fails with `Duplicate` if the id is taken.
    async fn insert(&self, schedule: Schedule) -> StoreResult<Schedule>;

    async fn get(&self, id: &str) -> StoreResult<Option<Schedule>>;

    /// Replace the definition of an existing schedule.
    ///
    /// `last_run` and `created_at` are kept from the stored record, and so is
    /// `next_run` unless `reschedule` is set. A firing claimed while the
    /// edit was in flight is never written back.
    async fn update(&self, schedule: Schedule, reschedule: bool) -> StoreResult<Schedule>;

    /// Remove a schedule. Returns `false` when nothing was stored under `id`.
    async fn delete(&self, id: &str) -> StoreResult<bool>;

    /// All schedules, oldest first.
    async fn list(&self) -> StoreResult<Vec<Schedule>>;

    /// Enabled schedules, oldest first.
    async fn list_enabled(&self) -> StoreResult<Vec<Schedule>>;

    /// Enabled schedules whose `next_run` is at or before `now`, earliest first.
    async fn list_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>>;

    /// Advance a firing.
    ///
    /// Writes `next_run` (and `last_run` when given) only if the stored
    /// `next_run` still equals `expected_next_run`. Returns whether the write
    /// happened; a missing schedule is reported as `false`.
    async fn claim(
        &self,
        id: &str,
        expected_next_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
        last_run: Option<DateTime<Utc>>,
    ) -> StoreResult<bool>;
}

/// Append-mostly execution history.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new execution. Fails with `Duplicate` if the id is taken.
    async fn create(&self, execution: Execution) -> StoreResult<Execution>;

    async fn get(&self, id: &str) -> StoreResult<Option<Execution>>;

    /// Move an execution to `to`.
    ///
    /// Returns [`Transition::Duplicate`] without writing when the execution
    /// already has status `to`, and `InvalidTransition` when `to` would move
    /// the status backwards or out of a terminal state.
    async fn transition(
        &self,
        id: &str,
        to: ExecutionStatus,
        update: TransitionUpdate,
    ) -> StoreResult<Transition>;

    /// Record the dispatcher handle.
    async fn set_task_id(&self, id: &str, task_id: &str) -> StoreResult<()>;

    /// Filtered listing, newest first.
    async fn list(&self, query: &ExecutionQuery) -> StoreResult<Page<Execution>>;

    /// Most recently started execution of a pipeline.
    async fn latest_for_pipeline(&self, pipeline_id: &str) -> StoreResult<Option<Execution>>;

    /// Append a log line. Allowed in every status.
    async fn append_log(&self, id: &str, line: &str) -> StoreResult<LogEntry>;

    /// Log lines in append order.
    async fn logs(&self, id: &str) -> StoreResult<Vec<LogEntry>>;
}

/// The pair of stores an orchestrator runs against.
#[derive(Clone)]
pub struct Stores {
    pub schedules: Arc<dyn ScheduleStore>,
    pub executions: Arc<dyn ExecutionStore>,
}

impl Stores {
    /// Stores that live only as long as the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            schedules: Arc::new(InMemoryScheduleStore::new()),
            executions: Arc::new(InMemoryExecutionStore::new()),
        }
    }

    /// `SQLite` stores sharing one database file.
    pub async fn sqlite(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let schedules = SqliteScheduleStore::new(path.clone()).await?;
        let executions = SqliteExecutionStore::new(path).await?;
        Ok(Self {
            schedules: Arc::new(schedules),
            executions: Arc::new(executions),
        })
    }
}

impl fmt::Debug for Stores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stores")
            .field("schedules", &"<dyn ScheduleStore>")
            .field("executions", &"<dyn ExecutionStore>")
            .finish()
    }
}
