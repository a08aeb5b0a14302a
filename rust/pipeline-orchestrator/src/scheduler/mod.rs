//! Periodic evaluation of schedules.
//!
//! [`SchedulerLoop`] drives a [`Tick`] implementation on a fixed interval.
//! The orchestrator implements [`Tick`]; each call evaluates every enabled
//! schedule once and reports what happened in a [`TickSummary`].

pub mod driver;

pub use driver::SchedulerLoop;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dependency::UnmetDependency;
use crate::error::OrchestratorResult;

/// One evaluation pass over the schedules.
#[async_trait]
pub trait Tick: Send + Sync {
    /// Evaluate every enabled schedule at `now`. With `force`, every enabled
    /// schedule is treated as due.
    async fn tick(&self, now: DateTime<Utc>, force: bool) -> OrchestratorResult<TickSummary>;
}

/// Whether the loop task is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Stopped,
    Running,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub state: LoopState,
    /// Interval of the running loop, or of the last one.
    pub interval_secs: Option<u64>,
    pub last_tick: Option<DateTime<Utc>>,
    pub next_tick_eta: Option<DateTime<Utc>>,
    pub last_summary: Option<TickSummary>,
}

/// What happened to one due schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    /// An execution was created and handed to the dispatcher.
    Dispatched { execution_id: String },
    /// Prerequisites blocked the firing; no execution was created.
    DependencyUnsatisfied {
        unmet: Vec<UnmetDependency>,
        /// Whether `next_run` moved past this firing.
        advanced: bool,
    },
    /// Another evaluator or an edit changed `next_run` first.
    Superseded,
    /// The execution was created but could not be enqueued.
    EnqueueFailed { execution_id: String, error: String },
    /// Evaluating the schedule failed.
    Error { error: String },
}

/// Outcome for one schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub schedule_id: String,
    pub pipeline_id: String,
    #[serde(flatten)]
    pub outcome: ScheduleOutcome,
}

/// Result of one tick. Schedules that were not due appear only in `evaluated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub forced: bool,
    pub evaluated: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<ScheduleReport>,
}

impl TickSummary {
    #[must_use]
    pub fn new(started_at: DateTime<Utc>, forced: bool) -> Self {
        Self {
            started_at,
            finished_at: None,
            forced,
            evaluated: 0,
            dispatched: 0,
            skipped: 0,
            failed: 0,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, report: ScheduleReport) {
        match report.outcome {
            ScheduleOutcome::Dispatched { .. } => self.dispatched += 1,
            ScheduleOutcome::DependencyUnsatisfied { .. } | ScheduleOutcome::Superseded => {
                self.skipped += 1;
            }
            ScheduleOutcome::EnqueueFailed { .. } | ScheduleOutcome::Error { .. } => self.failed += 1,
        }
        self.outcomes.push(report);
    }

    #[must_use]
    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    /// Outcome recorded for `schedule_id`, if it was due.
    pub fn outcome_for(&self, schedule_id: &str) -> Option<&ScheduleOutcome> {
        self.outcomes
            .iter()
            .find(|r| r.schedule_id == schedule_id)
            .map(|r| &r.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::UnmetReason;

    fn report(id: &str, outcome: ScheduleOutcome) -> ScheduleReport {
        ScheduleReport {
            schedule_id: id.to_string(),
            pipeline_id: "daily-sales".to_string(),
            outcome,
        }
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = TickSummary::new(Utc::now(), false);
        summary.evaluated = 5;
        summary.record(report(
            "s-1",
            ScheduleOutcome::Dispatched {
                execution_id: "e-1".to_string(),
            },
        ));
        summary.record(report("s-2", ScheduleOutcome::Superseded));
        summary.record(report(
            "s-3",
            ScheduleOutcome::DependencyUnsatisfied {
                unmet: vec![],
                advanced: true,
            },
        ));
        summary.record(report(
            "s-4",
            ScheduleOutcome::Error {
                error: "database is locked".to_string(),
            },
        ));
        let summary = summary.finish();

        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.finished_at.is_some());
        assert_eq!(summary.outcome_for("s-2"), Some(&ScheduleOutcome::Superseded));
        assert!(summary.outcome_for("s-5").is_none());
    }

    #[test]
    fn test_report_json_shape() {
        let json = serde_json::to_value(report(
            "s-1",
            ScheduleOutcome::DependencyUnsatisfied {
                unmet: vec![UnmetDependency {
                    pipeline_id: "extract".to_string(),
                    reason: UnmetReason::NeverRun,
                }],
                advanced: false,
            },
        ))
        .unwrap();

        assert_eq!(json["schedule_id"], "s-1");
        assert_eq!(json["outcome"], "dependency_unsatisfied");
        assert_eq!(json["unmet"][0]["pipeline_id"], "extract");
        assert_eq!(json["unmet"][0]["reason"], "never_run");
    }
}
