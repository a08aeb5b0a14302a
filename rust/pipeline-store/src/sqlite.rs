//! `SQLite` stores for schedules and executions.
//!
//! Both stores can share one database file. Each operation opens its own
//! connection on the blocking thread pool; WAL mode plus a busy timeout lets
//! the scheduler loop and status callbacks write concurrently.
//!
//! Timestamps are stored as Unix epoch milliseconds, parameters as JSON text.
//!
//! # Example
//!
//! ```rust,ignore
//! use pipeline_store::{SqliteExecutionStore, SqliteScheduleStore};
//!
//! let schedules = SqliteScheduleStore::new("./pipeline-orchestrator.db").await?;
//! let executions = SqliteExecutionStore::new("./pipeline-orchestrator.db").await?;
//! ```

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tokio::task;

use crate::error::{StoreError, StoreResult};
use crate::model::{
    Execution, ExecutionQuery, ExecutionStatus, LogEntry, Page, Parameters, Schedule, Transition,
    TransitionUpdate, Trigger,
};
use crate::{ExecutionStore, ScheduleStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEDULE_COLUMNS: &str = "id, pipeline_id, cron_expression, enabled, parameters, description, \
     max_attempts, dependency_staleness_secs, next_run, last_run, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, pipeline_id, schedule_id, correlation_id, trigger_kind, status, \
     attempt, parameters, task_id, error, log_ref, started_at, updated_at, ended_at";

/// Path to a database file plus the plumbing shared by both stores.
#[derive(Debug, Clone)]
struct Database {
    db_path: PathBuf,
}

impl Database {
    async fn open(path: PathBuf) -> StoreResult<Self> {
        let db = Self { db_path: path };
        db.migrate_schema().await?;
        Ok(db)
    }

    /// Run `f` against a fresh connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            let mut conn = Connection::open(&db_path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            f(&mut conn)
        })
        .await?
    }

    async fn migrate_schema(&self) -> StoreResult<()> {
        self.call(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;

            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS schedules (
                    id TEXT PRIMARY KEY,
                    pipeline_id TEXT NOT NULL,
                    cron_expression TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    parameters TEXT,
                    description TEXT,
                    max_attempts INTEGER,
                    dependency_staleness_secs INTEGER,
                    next_run INTEGER,
                    last_run INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(enabled, next_run);
                CREATE INDEX IF NOT EXISTS idx_schedules_pipeline ON schedules(pipeline_id);

                CREATE TABLE IF NOT EXISTS executions (
                    id TEXT PRIMARY KEY,
                    pipeline_id TEXT NOT NULL,
                    schedule_id TEXT,
                    correlation_id TEXT NOT NULL,
                    trigger_kind TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempt INTEGER NOT NULL DEFAULT 1,
                    parameters TEXT NOT NULL,
                    task_id TEXT,
                    error TEXT,
                    log_ref TEXT,
                    started_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    ended_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_executions_pipeline
                    ON executions(pipeline_id, started_at);
                CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
                CREATE INDEX IF NOT EXISTS idx_executions_correlation
                    ON executions(correlation_id);

                CREATE TABLE IF NOT EXISTS execution_logs (
                    execution_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    at INTEGER NOT NULL,
                    line TEXT NOT NULL,
                    PRIMARY KEY (execution_id, sequence)
                );
                ",
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(path = %self.db_path.display(), "SQLite schema ready");
        Ok(())
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {millis}")))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => timestamp(row, idx).map(Some),
        None => Ok(None),
    }
}

fn parameters(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Parameters>> {
    row.get::<_, Option<String>>(idx)?
        .map(|json| serde_json::from_str(&json).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn encode_parameters(parameters: Option<&Parameters>) -> StoreResult<Option<String>> {
    Ok(parameters.map(serde_json::to_string).transpose()?)
}

fn read_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        cron_expression: row.get(2)?,
        enabled: row.get(3)?,
        parameters: parameters(row, 4)?,
        description: row.get(5)?,
        max_attempts: row.get(6)?,
        dependency_staleness_secs: row
            .get::<_, Option<i64>>(7)?
            .map(|secs| u64::try_from(secs).map_err(|e| conversion_error(7, e)))
            .transpose()?,
        next_run: optional_timestamp(row, 8)?,
        last_run: optional_timestamp(row, 9)?,
        created_at: timestamp(row, 10)?,
        updated_at: timestamp(row, 11)?,
    })
}

fn read_execution(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let trigger: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(Execution {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        schedule_id: row.get(2)?,
        correlation_id: row.get(3)?,
        trigger: Trigger::from_str(&trigger).map_err(|e| conversion_error(4, e))?,
        status: ExecutionStatus::from_str(&status).map_err(|e| conversion_error(5, e))?,
        attempt: row.get(6)?,
        parameters: parameters(row, 7)?.unwrap_or_default(),
        task_id: row.get(8)?,
        error: row.get(9)?,
        log_ref: row.get(10)?,
        started_at: timestamp(row, 11)?,
        updated_at: timestamp(row, 12)?,
        ended_at: optional_timestamp(row, 13)?,
    })
}

fn staleness_column(schedule: &Schedule) -> StoreResult<Option<i64>> {
    schedule
        .dependency_staleness_secs
        .map(|secs| {
            i64::try_from(secs).map_err(|e| {
                StoreError::Corrupt(format!("staleness window out of range for {}: {e}", schedule.id))
            })
        })
        .transpose()
}

/// `SQLite`-backed [`ScheduleStore`].
#[derive(Debug, Clone)]
pub struct SqliteScheduleStore {
    db: Database,
}

impl SqliteScheduleStore {
    /// Open (and migrate) the database at `path`.
    pub async fn new<P: Into<PathBuf>>(path: P) -> StoreResult<Self> {
        Ok(Self {
            db: Database::open(path.into()).await?,
        })
    }

    async fn select(&self, filter: &'static str, args: Vec<Value>) -> StoreResult<Vec<Schedule>> {
        self.db
            .call(move |conn| {
                let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules {filter}");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(args.iter()), read_schedule)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn insert(&self, schedule: Schedule) -> StoreResult<Schedule> {
        self.db
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM schedules WHERE id = ?1)",
                    params![&schedule.id],
                    |row| row.get(0),
                )?;
                if exists {
                    return Err(StoreError::Duplicate {
                        kind: "schedule",
                        id: schedule.id,
                    });
                }

                conn.execute(
                    &format!(
                        "INSERT INTO schedules ({SCHEDULE_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                    ),
                    params![
                        &schedule.id,
                        &schedule.pipeline_id,
                        &schedule.cron_expression,
                        schedule.enabled,
                        encode_parameters(schedule.parameters.as_ref())?,
                        &schedule.description,
                        schedule.max_attempts,
                        staleness_column(&schedule)?,
                        schedule.next_run.map(to_millis),
                        schedule.last_run.map(to_millis),
                        to_millis(schedule.created_at),
                        to_millis(schedule.updated_at),
                    ],
                )?;
                Ok(schedule)
            })
            .await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Schedule>> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                        params![&id],
                        read_schedule,
                    )
                    .optional()?)
            })
            .await
    }

    async fn update(&self, schedule: Schedule, reschedule: bool) -> StoreResult<Schedule> {
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    r"
                    UPDATE schedules
                    SET pipeline_id = ?2, cron_expression = ?3, enabled = ?4, parameters = ?5,
                        description = ?6, max_attempts = ?7, dependency_staleness_secs = ?8,
                        next_run = CASE WHEN ?11 THEN ?9 ELSE next_run END, updated_at = ?10
                    WHERE id = ?1
                    ",
                    params![
                        &schedule.id,
                        &schedule.pipeline_id,
                        &schedule.cron_expression,
                        schedule.enabled,
                        encode_parameters(schedule.parameters.as_ref())?,
                        &schedule.description,
                        schedule.max_attempts,
                        staleness_column(&schedule)?,
                        schedule.next_run.map(to_millis),
                        to_millis(schedule.updated_at),
                        reschedule,
                    ],
                )?;
                if changed == 0 {
                    return Err(StoreError::schedule_not_found(schedule.id));
                }

                Ok(conn.query_row(
                    &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                    params![&schedule.id],
                    read_schedule,
                )?)
            })
            .await
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let removed = conn.execute("DELETE FROM schedules WHERE id = ?1", params![&id])?;
                Ok(removed > 0)
            })
            .await
    }

    async fn list(&self) -> StoreResult<Vec<Schedule>> {
        self.select("ORDER BY created_at ASC, id ASC", Vec::new())
            .await
    }

    async fn list_enabled(&self) -> StoreResult<Vec<Schedule>> {
        self.select("WHERE enabled = 1 ORDER BY created_at ASC, id ASC", Vec::new())
            .await
    }

    async fn list_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>> {
        self.select(
            "WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?1 ORDER BY next_run ASC",
            vec![Value::Integer(to_millis(now))],
        )
        .await
    }

    async fn claim(
        &self,
        id: &str,
        expected_next_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
        last_run: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    r"
                    UPDATE schedules
                    SET next_run = ?3, last_run = COALESCE(?4, last_run)
                    WHERE id = ?1 AND next_run IS ?2
                    ",
                    params![
                        &id,
                        expected_next_run.map(to_millis),
                        next_run.map(to_millis),
                        last_run.map(to_millis),
                    ],
                )?;
                Ok(changed == 1)
            })
            .await
    }
}

/// `SQLite`-backed [`ExecutionStore`].
#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    db: Database,
}

impl SqliteExecutionStore {
    /// Open (and migrate) the database at `path`.
    pub async fn new<P: Into<PathBuf>>(path: P) -> StoreResult<Self> {
        Ok(Self {
            db: Database::open(path.into()).await?,
        })
    }
}

fn select_execution(conn: &Connection, id: &str) -> StoreResult<Option<Execution>> {
    Ok(conn
        .query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
            params![id],
            read_execution,
        )
        .optional()?)
}

fn execution_exists(conn: &Connection, id: &str) -> StoreResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM executions WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )?)
}

fn query_filters(query: &ExecutionQuery) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();
    if let Some(pipeline_id) = &query.pipeline_id {
        args.push(Value::Text(pipeline_id.clone()));
        clauses.push(format!("pipeline_id = ?{}", args.len()));
    }
    if let Some(schedule_id) = &query.schedule_id {
        args.push(Value::Text(schedule_id.clone()));
        clauses.push(format!("schedule_id = ?{}", args.len()));
    }
    if let Some(status) = query.status {
        args.push(Value::Text(status.as_str().to_string()));
        clauses.push(format!("status = ?{}", args.len()));
    }
    if let Some(correlation_id) = &query.correlation_id {
        args.push(Value::Text(correlation_id.clone()));
        clauses.push(format!("correlation_id = ?{}", args.len()));
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), args)
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create(&self, execution: Execution) -> StoreResult<Execution> {
        self.db
            .call(move |conn| {
                if execution_exists(conn, &execution.id)? {
                    return Err(StoreError::Duplicate {
                        kind: "execution",
                        id: execution.id,
                    });
                }

                conn.execute(
                    &format!(
                        "INSERT INTO executions ({EXECUTION_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                    ),
                    params![
                        &execution.id,
                        &execution.pipeline_id,
                        &execution.schedule_id,
                        &execution.correlation_id,
                        execution.trigger.as_str(),
                        execution.status.as_str(),
                        execution.attempt,
                        serde_json::to_string(&execution.parameters)?,
                        &execution.task_id,
                        &execution.error,
                        &execution.log_ref,
                        to_millis(execution.started_at),
                        to_millis(execution.updated_at),
                        execution.ended_at.map(to_millis),
                    ],
                )?;
                Ok(execution)
            })
            .await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Execution>> {
        let id = id.to_string();
        self.db.call(move |conn| select_execution(conn, &id)).await
    }

    async fn transition(
        &self,
        id: &str,
        to: ExecutionStatus,
        update: TransitionUpdate,
    ) -> StoreResult<Transition> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                // IMMEDIATE takes the write lock up front so the read below
                // cannot go stale before the update.
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let mut execution =
                    select_execution(&tx, &id)?.ok_or_else(|| StoreError::execution_not_found(&id))?;
                let from = execution.status;
                if from == to {
                    return Ok(Transition::Duplicate(execution));
                }
                if !from.can_transition_to(to) {
                    return Err(StoreError::InvalidTransition { id, from, to });
                }

                execution.apply(to, &update);
                tx.execute(
                    r"
                    UPDATE executions
                    SET status = ?2, updated_at = ?3, ended_at = ?4, error = ?5, log_ref = ?6
                    WHERE id = ?1 AND status = ?7
                    ",
                    params![
                        &id,
                        to.as_str(),
                        to_millis(execution.updated_at),
                        execution.ended_at.map(to_millis),
                        &execution.error,
                        &execution.log_ref,
                        from.as_str(),
                    ],
                )?;
                tx.commit()?;
                Ok(Transition::Applied(execution))
            })
            .await
    }

    async fn set_task_id(&self, id: &str, task_id: &str) -> StoreResult<()> {
        let id = id.to_string();
        let task_id = task_id.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE executions SET task_id = ?2 WHERE id = ?1",
                    params![&id, &task_id],
                )?;
                if changed == 0 {
                    return Err(StoreError::execution_not_found(id));
                }
                Ok(())
            })
            .await
    }

    async fn list(&self, query: &ExecutionQuery) -> StoreResult<Page<Execution>> {
        let query = query.clone();
        self.db
            .call(move |conn| {
                let (filter, mut args) = query_filters(&query);

                let total: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM executions {filter}"),
                    params_from_iter(args.iter()),
                    |row| row.get(0),
                )?;

                let limit = query.effective_limit();
                args.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
                let limit_idx = args.len();
                args.push(Value::Integer(i64::try_from(query.offset).unwrap_or(i64::MAX)));
                let offset_idx = args.len();

                let sql = format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions {filter} \
                     ORDER BY started_at DESC, rowid DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let items = stmt
                    .query_map(params_from_iter(args.iter()), read_execution)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                Ok(Page {
                    items,
                    total: usize::try_from(total).unwrap_or_default(),
                    limit,
                    offset: query.offset,
                })
            })
            .await
    }

    async fn latest_for_pipeline(&self, pipeline_id: &str) -> StoreResult<Option<Execution>> {
        let pipeline_id = pipeline_id.to_string();
        self.db
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE pipeline_id = ?1 \
                             ORDER BY started_at DESC, rowid DESC LIMIT 1"
                        ),
                        params![&pipeline_id],
                        read_execution,
                    )
                    .optional()?)
            })
            .await
    }

    async fn append_log(&self, id: &str, line: &str) -> StoreResult<LogEntry> {
        let id = id.to_string();
        let line = line.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if !execution_exists(&tx, &id)? {
                    return Err(StoreError::execution_not_found(id));
                }

                let next: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(sequence) + 1, 0) FROM execution_logs WHERE execution_id = ?1",
                    params![&id],
                    |row| row.get(0),
                )?;
                let at = Utc::now();
                tx.execute(
                    "INSERT INTO execution_logs (execution_id, sequence, at, line) VALUES (?1, ?2, ?3, ?4)",
                    params![&id, next, to_millis(at), &line],
                )?;
                tx.commit()?;

                Ok(LogEntry {
                    sequence: u64::try_from(next).unwrap_or_default(),
                    at,
                    line,
                })
            })
            .await
    }

    async fn logs(&self, id: &str) -> StoreResult<Vec<LogEntry>> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                if !execution_exists(conn, &id)? {
                    return Err(StoreError::execution_not_found(id));
                }

                let mut stmt = conn.prepare(
                    "SELECT sequence, at, line FROM execution_logs WHERE execution_id = ?1 ORDER BY sequence",
                )?;
                let entries = stmt
                    .query_map(params![&id], |row| {
                        let sequence: i64 = row.get(0)?;
                        Ok(LogEntry {
                            sequence: u64::try_from(sequence).map_err(|e| conversion_error(0, e))?,
                            at: timestamp(row, 1)?,
                            line: row.get(2)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(entries)
            })
            .await
    }
}
