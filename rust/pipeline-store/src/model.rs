//! Schedule and execution records.
//!
//! These are the values persisted by [`ScheduleStore`](crate::ScheduleStore)
//! and [`ExecutionStore`](crate::ExecutionStore). They carry no behavior
//! beyond the status ordering rules every store has to enforce.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ParameterError, StoreError, StoreResult};

/// Default page size for execution listings.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page an execution listing will return.
pub const MAX_PAGE_SIZE: usize = 100;

/// A scalar run parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl ParamValue {
    /// Convert a JSON scalar. Arrays and objects are rejected.
    pub fn from_json(key: &str, value: serde_json::Value) -> Result<Self, ParameterError> {
        match value {
            serde_json::Value::Null => Ok(Self::Null),
            serde_json::Value::Bool(b) => Ok(Self::Bool(b)),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number).ok_or_else(|| {
                ParameterError::Unsupported {
                    key: key.to_string(),
                }
            }),
            serde_json::Value::String(s) => Ok(Self::String(s)),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Err(ParameterError::Unsupported {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Render the value the way it is handed to a worker process.
    #[must_use]
    pub fn to_env_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::String(s) => s.clone(),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

/// Ordered run parameters.
pub type Parameters = BTreeMap<String, ParamValue>;

/// Build [`Parameters`] from a JSON object.
pub fn parameters_from_json(value: serde_json::Value) -> Result<Parameters, ParameterError> {
    let serde_json::Value::Object(map) = value else {
        return Err(ParameterError::NotAnObject);
    };
    map.into_iter()
        .map(|(key, value)| {
            let param = ParamValue::from_json(&key, value)?;
            Ok((key, param))
        })
        .collect()
}

/// A persistent rule binding a pipeline, a cron trigger and run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique schedule identifier.
    pub id: String,
    /// Pipeline fired by this schedule.
    pub pipeline_id: String,
    /// Five-field cron expression, stored exactly as supplied.
    pub cron_expression: String,
    /// Disabled schedules are never selected.
    pub enabled: bool,
    /// Parameters passed to every run.
    pub parameters: Option<Parameters>,
    /// Free-form description.
    pub description: Option<String>,
    /// Overrides the global retry limit.
    pub max_attempts: Option<u32>,
    /// Overrides the global prerequisite staleness window.
    pub dependency_staleness_secs: Option<u64>,
    /// Next trigger instant. `None` while disabled.
    pub next_run: Option<DateTime<Utc>>,
    /// Instant of the last dispatch.
    pub last_run: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last administrative change.
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Create an enabled schedule with a fresh id and no trigger computed yet.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline_id: pipeline_id.into(),
            cron_expression: cron_expression.into(),
            enabled: true,
            parameters: None,
            description: None,
            max_attempts: None,
            dependency_staleness_secs: None,
            next_run: None,
            last_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the stored trigger has been reached.
    #[must_use]
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|next| next <= now)
    }
}

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet picked up by a worker.
    Pending,
    /// A worker is running the pipeline.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl ExecutionStatus {
    /// Convert status to string for database storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse status from database string.
    #[allow(clippy::should_implement_trait, reason = "Different signature than std::str::FromStr")]
    pub fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(StoreError::Corrupt(format!("invalid execution status: {s}"))),
        }
    }

    /// Completed, failed and cancelled are final.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Statuses only move forward: pending, running, then one terminal state.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        to.rank() > self.rank()
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fired by a schedule.
    Scheduled,
    /// Started on demand.
    Manual,
    /// Automatic retry of a failed attempt.
    Retry,
}

impl Trigger {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Retry => "retry",
        }
    }

    #[allow(clippy::should_implement_trait, reason = "Different signature than std::str::FromStr")]
    pub fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            "retry" => Ok(Self::Retry),
            _ => Err(StoreError::Corrupt(format!("invalid trigger: {s}"))),
        }
    }
}

/// One concrete run attempt of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique execution identifier.
    pub id: String,
    /// Pipeline being run.
    pub pipeline_id: String,
    /// Originating schedule, `None` for manual runs.
    pub schedule_id: Option<String>,
    /// Shared by every attempt of one firing.
    pub correlation_id: String,
    /// What caused this execution.
    pub trigger: Trigger,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Parameter snapshot taken at dispatch.
    pub parameters: Parameters,
    /// Handle returned by the task dispatcher.
    pub task_id: Option<String>,
    /// Last failure detail.
    pub error: Option<String>,
    /// Reference to externally stored logs.
    pub log_ref: Option<String>,
    /// Creation timestamp.
    pub started_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// Set once the execution reaches a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// A manual, unscheduled first attempt.
    #[must_use]
    pub fn manual(pipeline_id: impl Into<String>, parameters: Parameters) -> Self {
        Self::first_attempt(pipeline_id.into(), None, Trigger::Manual, parameters)
    }

    /// The first attempt of a schedule firing.
    #[must_use]
    pub fn scheduled(schedule: &Schedule) -> Self {
        Self::first_attempt(
            schedule.pipeline_id.clone(),
            Some(schedule.id.clone()),
            Trigger::Scheduled,
            schedule.parameters.clone().unwrap_or_default(),
        )
    }

    fn first_attempt(
        pipeline_id: String,
        schedule_id: Option<String>,
        trigger: Trigger,
        parameters: Parameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline_id,
            schedule_id,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            trigger,
            status: ExecutionStatus::Pending,
            attempt: 1,
            parameters,
            task_id: None,
            error: None,
            log_ref: None,
            started_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// The follow-up attempt for this execution, linked by correlation id.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline_id: self.pipeline_id.clone(),
            schedule_id: self.schedule_id.clone(),
            correlation_id: self.correlation_id.clone(),
            trigger: Trigger::Retry,
            status: ExecutionStatus::Pending,
            attempt: self.attempt + 1,
            parameters: self.parameters.clone(),
            task_id: None,
            error: None,
            log_ref: None,
            started_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration once terminal.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|ended| ended - self.started_at)
    }

    /// Apply an already validated transition.
    pub(crate) fn apply(&mut self, to: ExecutionStatus, update: &TransitionUpdate) {
        self.status = to;
        self.updated_at = update.at;
        if to.is_terminal() {
            self.ended_at = Some(update.at);
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if let Some(log_ref) = &update.log_ref {
            self.log_ref = Some(log_ref.clone());
        }
    }
}

/// Extra fields written alongside a status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionUpdate {
    /// Transition instant.
    pub at: DateTime<Utc>,
    /// Failure detail.
    pub error: Option<String>,
    /// External log reference.
    pub log_ref: Option<String>,
}

impl TransitionUpdate {
    #[must_use]
    pub fn now() -> Self {
        Self {
            at: Utc::now(),
            error: None,
            log_ref: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_log_ref(mut self, log_ref: impl Into<String>) -> Self {
        self.log_ref = Some(log_ref.into());
        self
    }
}

impl Default for TransitionUpdate {
    fn default() -> Self {
        Self::now()
    }
}

/// Result of a status transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The status changed.
    Applied(Execution),
    /// The execution already had the requested status; nothing changed.
    Duplicate(Execution),
}

impl Transition {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    #[must_use]
    pub fn execution(&self) -> &Execution {
        match self {
            Self::Applied(execution) | Self::Duplicate(execution) => execution,
        }
    }

    #[must_use]
    pub fn into_execution(self) -> Execution {
        match self {
            Self::Applied(execution) | Self::Duplicate(execution) => execution,
        }
    }
}

/// One appended execution log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position within the execution's log, starting at 0.
    pub sequence: u64,
    /// Append time.
    pub at: DateTime<Utc>,
    /// Log text.
    pub line: String,
}

/// Filters for execution listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub pipeline_id: Option<String>,
    pub schedule_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub correlation_id: Option<String>,
    /// Page size, defaults to [`DEFAULT_PAGE_SIZE`] and is capped at [`MAX_PAGE_SIZE`].
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ExecutionQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    #[must_use]
    pub fn schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    /// Page size after defaulting and capping.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    /// Whether an execution passes every filter.
    #[must_use]
    pub fn matches(&self, execution: &Execution) -> bool {
        self.pipeline_id
            .as_ref()
            .is_none_or(|id| *id == execution.pipeline_id)
            && self
                .schedule_id
                .as_ref()
                .is_none_or(|id| execution.schedule_id.as_ref() == Some(id))
            && self.status.is_none_or(|status| status == execution.status)
            && self
                .correlation_id
                .as_ref()
                .is_none_or(|id| *id == execution.correlation_id)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matching records across all pages.
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order_is_monotonic() {
        use ExecutionStatus::{Cancelled, Completed, Failed, Pending, Running};

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(ExecutionStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(ExecutionStatus::from_str("paused").is_err());
    }

    #[test]
    fn test_parameters_reject_nested_values() {
        let params = parameters_from_json(serde_json::json!({
            "date": "2024-01-01",
            "limit": 10,
            "full": false,
            "cursor": null
        }))
        .unwrap();
        assert_eq!(params.len(), 4);
        assert_eq!(params["limit"], ParamValue::Number(10.0));
        assert_eq!(params["cursor"], ParamValue::Null);

        let err = parameters_from_json(serde_json::json!({"tables": ["a", "b"]})).unwrap_err();
        assert_eq!(
            err,
            ParameterError::Unsupported {
                key: "tables".to_string()
            }
        );
        assert_eq!(
            parameters_from_json(serde_json::json!([1, 2])).unwrap_err(),
            ParameterError::NotAnObject
        );
    }

    #[test]
    fn test_param_value_serializes_as_plain_json() {
        let mut params = Parameters::new();
        params.insert("name".to_string(), "daily".into());
        params.insert("dry_run".to_string(), true.into());
        params.insert("missing".to_string(), ParamValue::Null);

        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"dry_run": true, "missing": null, "name": "daily"})
        );
    }

    #[test]
    fn test_next_attempt_shares_correlation() {
        let schedule = Schedule::new("etl", "0 * * * *");
        let first = Execution::scheduled(&schedule);
        let second = first.next_attempt();

        assert_eq!(first.attempt, 1);
        assert_eq!(first.trigger, Trigger::Scheduled);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.trigger, Trigger::Retry);
        assert_eq!(second.correlation_id, first.correlation_id);
        assert_eq!(second.schedule_id.as_deref(), Some(schedule.id.as_str()));
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn test_query_limit_is_capped() {
        assert_eq!(ExecutionQuery::new().effective_limit(), DEFAULT_PAGE_SIZE);
        assert_eq!(ExecutionQuery::new().page(500, 0).effective_limit(), MAX_PAGE_SIZE);
        assert_eq!(ExecutionQuery::new().page(0, 0).effective_limit(), 1);
    }

    #[test]
    fn test_disabled_schedule_is_never_due() {
        let mut schedule = Schedule::new("etl", "* * * * *");
        let now = Utc::now();
        schedule.next_run = Some(now);
        assert!(schedule.is_due_at(now));

        schedule.enabled = false;
        assert!(!schedule.is_due_at(now));
    }
}
