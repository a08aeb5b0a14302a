//! In-memory stores.
//!
//! Every operation takes a single `parking_lot` lock, which makes the
//! compare-and-swap operations trivially atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::model::{
    Execution, ExecutionQuery, ExecutionStatus, LogEntry, Page, Schedule, Transition,
    TransitionUpdate,
};
use crate::{ExecutionStore, ScheduleStore};

/// In-memory schedule store.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    schedules: RwLock<HashMap<String, Schedule>>,
}

impl InMemoryScheduleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut schedules: Vec<Schedule>) -> Vec<Schedule> {
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        schedules
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn insert(&self, schedule: Schedule) -> StoreResult<Schedule> {
        let mut schedules = self.schedules.write();
        if schedules.contains_key(&schedule.id) {
            return Err(StoreError::Duplicate {
                kind: "schedule",
                id: schedule.id,
            });
        }
        schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(schedule)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Schedule>> {
        Ok(self.schedules.read().get(id).cloned())
    }

    async fn update(&self, schedule: Schedule, reschedule: bool) -> StoreResult<Schedule> {
        let mut schedules = self.schedules.write();
        let stored = schedules
            .get_mut(&schedule.id)
            .ok_or_else(|| StoreError::schedule_not_found(&schedule.id))?;

        let next_run = if reschedule { schedule.next_run } else { stored.next_run };
        let last_run = stored.last_run;
        let created_at = stored.created_at;
        *stored = Schedule {
            next_run,
            last_run,
            created_at,
            ..schedule
        };
        Ok(stored.clone())
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        Ok(self.schedules.write().remove(id).is_some())
    }

    async fn list(&self) -> StoreResult<Vec<Schedule>> {
        let schedules = self.schedules.read().values().cloned().collect();
        Ok(Self::sorted(schedules))
    }

    async fn list_enabled(&self) -> StoreResult<Vec<Schedule>> {
        let schedules = self
            .schedules
            .read()
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        Ok(Self::sorted(schedules))
    }

    async fn list_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>> {
        let mut due: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| s.is_due_at(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run);
        Ok(due)
    }

    async fn claim(
        &self,
        id: &str,
        expected_next_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
        last_run: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let mut schedules = self.schedules.write();
        let Some(stored) = schedules.get_mut(id) else {
            return Ok(false);
        };
        if stored.next_run != expected_next_run {
            return Ok(false);
        }
        stored.next_run = next_run;
        if last_run.is_some() {
            stored.last_run = last_run;
        }
        Ok(true)
    }
}

#[derive(Debug)]
struct StoredExecution {
    /// Insertion order, breaks ties between equal `started_at`.
    seq: u64,
    execution: Execution,
}

#[derive(Debug, Default)]
struct ExecutionTable {
    next_seq: u64,
    records: HashMap<String, StoredExecution>,
    logs: HashMap<String, Vec<LogEntry>>,
}

/// In-memory execution store.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    table: RwLock<ExecutionTable>,
}

impl InMemoryExecutionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(records: &mut [&StoredExecution]) {
        records.sort_by(|a, b| {
            b.execution
                .started_at
                .cmp(&a.execution.started_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, execution: Execution) -> StoreResult<Execution> {
        let mut table = self.table.write();
        if table.records.contains_key(&execution.id) {
            return Err(StoreError::Duplicate {
                kind: "execution",
                id: execution.id,
            });
        }
        let seq = table.next_seq;
        table.next_seq += 1;
        table.records.insert(
            execution.id.clone(),
            StoredExecution {
                seq,
                execution: execution.clone(),
            },
        );
        Ok(execution)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Execution>> {
        Ok(self
            .table
            .read()
            .records
            .get(id)
            .map(|r| r.execution.clone()))
    }

    async fn transition(
        &self,
        id: &str,
        to: ExecutionStatus,
        update: TransitionUpdate,
    ) -> StoreResult<Transition> {
        let mut table = self.table.write();
        let record = table
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::execution_not_found(id))?;

        let from = record.execution.status;
        if from == to {
            return Ok(Transition::Duplicate(record.execution.clone()));
        }
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }
        record.execution.apply(to, &update);
        Ok(Transition::Applied(record.execution.clone()))
    }

    async fn set_task_id(&self, id: &str, task_id: &str) -> StoreResult<()> {
        let mut table = self.table.write();
        let record = table
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::execution_not_found(id))?;
        record.execution.task_id = Some(task_id.to_string());
        Ok(())
    }

    async fn list(&self, query: &ExecutionQuery) -> StoreResult<Page<Execution>> {
        let table = self.table.read();
        let mut matching: Vec<&StoredExecution> = table
            .records
            .values()
            .filter(|r| query.matches(&r.execution))
            .collect();
        Self::newest_first(&mut matching);

        let limit = query.effective_limit();
        let items = matching
            .iter()
            .skip(query.offset)
            .take(limit)
            .map(|r| r.execution.clone())
            .collect();
        Ok(Page {
            items,
            total: matching.len(),
            limit,
            offset: query.offset,
        })
    }

    async fn latest_for_pipeline(&self, pipeline_id: &str) -> StoreResult<Option<Execution>> {
        let table = self.table.read();
        Ok(table
            .records
            .values()
            .filter(|r| r.execution.pipeline_id == pipeline_id)
            .max_by(|a, b| {
                a.execution
                    .started_at
                    .cmp(&b.execution.started_at)
                    .then_with(|| a.seq.cmp(&b.seq))
            })
            .map(|r| r.execution.clone()))
    }

    async fn append_log(&self, id: &str, line: &str) -> StoreResult<LogEntry> {
        let mut table = self.table.write();
        if !table.records.contains_key(id) {
            return Err(StoreError::execution_not_found(id));
        }
        let lines = table.logs.entry(id.to_string()).or_default();
        let entry = LogEntry {
            sequence: lines.len() as u64,
            at: Utc::now(),
            line: line.to_string(),
        };
        lines.push(entry.clone());
        Ok(entry)
    }

    async fn logs(&self, id: &str) -> StoreResult<Vec<LogEntry>> {
        let table = self.table.read();
        if !table.records.contains_key(id) {
            return Err(StoreError::execution_not_found(id));
        }
        Ok(table.logs.get(id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parameters;

    #[tokio::test]
    async fn test_claim_is_compare_and_swap() {
        let store = InMemoryScheduleStore::new();
        let now = Utc::now();
        let mut schedule = Schedule::new("etl", "* * * * *");
        schedule.next_run = Some(now);
        let schedule = store.insert(schedule).await.unwrap();

        let later = now + chrono::Duration::minutes(1);
        assert!(store
            .claim(&schedule.id, Some(now), Some(later), Some(now))
            .await
            .unwrap());
        // Second claimer still expects the old trigger.
        assert!(!store
            .claim(&schedule.id, Some(now), Some(later), Some(now))
            .await
            .unwrap());
        assert!(!store.claim("missing", None, None, None).await.unwrap());

        let stored = store.get(&schedule.id).await.unwrap().unwrap();
        assert_eq!(stored.next_run, Some(later));
        assert_eq!(stored.last_run, Some(now));
    }

    #[tokio::test]
    async fn test_update_keeps_last_run() {
        let store = InMemoryScheduleStore::new();
        let now = Utc::now();
        let mut schedule = Schedule::new("etl", "* * * * *");
        schedule.last_run = Some(now);
        let schedule = store.insert(schedule).await.unwrap();

        let mut edited = schedule.clone();
        edited.cron_expression = "0 * * * *".to_string();
        edited.last_run = None;
        let stored = store.update(edited, true).await.unwrap();

        assert_eq!(stored.cron_expression, "0 * * * *");
        assert_eq!(stored.last_run, Some(now));
    }

    #[tokio::test]
    async fn test_update_without_reschedule_keeps_claimed_firing() {
        let store = InMemoryScheduleStore::new();
        let now = Utc::now();
        let mut schedule = Schedule::new("etl", "0 * * * *");
        schedule.next_run = Some(now);
        let schedule = store.insert(schedule).await.unwrap();

        // A tick claims the firing after the admin edit read the record.
        let later = now + chrono::TimeDelta::hours(1);
        assert!(store.claim(&schedule.id, Some(now), Some(later), Some(now)).await.unwrap());

        let mut edited = schedule.clone();
        edited.description = Some("hourly".to_string());
        let stored = store.update(edited.clone(), false).await.unwrap();
        assert_eq!(stored.next_run, Some(later));
        assert_eq!(stored.description.as_deref(), Some("hourly"));

        edited.next_run = None;
        let stored = store.update(edited, true).await.unwrap();
        assert_eq!(stored.next_run, None);
    }

    #[tokio::test]
    async fn test_transition_rejects_leaving_terminal_state() {
        let store = InMemoryExecutionStore::new();
        let execution = store
            .create(Execution::manual("etl", Parameters::new()))
            .await
            .unwrap();

        let failed = store
            .transition(&execution.id, ExecutionStatus::Failed, TransitionUpdate::now())
            .await
            .unwrap();
        assert!(failed.is_applied());
        assert!(failed.execution().ended_at.is_some());

        let err = store
            .transition(&execution.id, ExecutionStatus::Completed, TransitionUpdate::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let duplicate = store
            .transition(&execution.id, ExecutionStatus::Failed, TransitionUpdate::now())
            .await
            .unwrap();
        assert!(!duplicate.is_applied());

        let stored = store.get(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_logs_append_after_terminal() {
        let store = InMemoryExecutionStore::new();
        let execution = store
            .create(Execution::manual("etl", Parameters::new()))
            .await
            .unwrap();
        store
            .transition(&execution.id, ExecutionStatus::Cancelled, TransitionUpdate::now())
            .await
            .unwrap();

        store.append_log(&execution.id, "cancelled").await.unwrap();
        let entry = store.append_log(&execution.id, "cleanup done").await.unwrap();
        assert_eq!(entry.sequence, 1);

        let logs = store.logs(&execution.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].line, "cancelled");
        assert!(store.append_log("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_latest_for_pipeline_uses_insertion_order_on_ties() {
        let store = InMemoryExecutionStore::new();
        let first = Execution::manual("etl", Parameters::new());
        let mut second = Execution::manual("etl", Parameters::new());
        second.started_at = first.started_at;

        store.create(first).await.unwrap();
        let second = store.create(second).await.unwrap();
        store
            .create(Execution::manual("other", Parameters::new()))
            .await
            .unwrap();

        let latest = store.latest_for_pipeline("etl").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(store.latest_for_pipeline("none").await.unwrap().is_none());
    }
}
