//! Prerequisite checks between pipelines.
//!
//! A prerequisite is met when the most recent execution of that pipeline
//! completed, and, when a staleness window applies, ended within it. The
//! check is advisory and only consulted when a schedule is about to fire.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use pipeline_store::{ExecutionStatus, ExecutionStore};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorResult;

/// Why a prerequisite is not met.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnmetReason {
    /// The prerequisite has no executions at all.
    NeverRun,
    /// Its latest execution has not completed.
    NotCompleted { status: ExecutionStatus },
    /// Its latest completion is older than the staleness window.
    Stale { ended_at: DateTime<Utc> },
}

/// A prerequisite that blocks a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmetDependency {
    pub pipeline_id: String,
    #[serde(flatten)]
    pub reason: UnmetReason,
}

impl fmt::Display for UnmetDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            UnmetReason::NeverRun => write!(f, "{} has never run", self.pipeline_id),
            UnmetReason::NotCompleted { status } => {
                write!(f, "{} latest execution is {status}", self.pipeline_id)
            }
            UnmetReason::Stale { ended_at } => {
                write!(f, "{} last completed at {ended_at}", self.pipeline_id)
            }
        }
    }
}

/// Outcome of a prerequisite check.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DependencyCheck {
    pub unmet: Vec<UnmetDependency>,
}

impl DependencyCheck {
    pub fn is_satisfied(&self) -> bool {
        self.unmet.is_empty()
    }
}

/// Resolves prerequisites against the execution history.
#[derive(Clone)]
pub struct DependencyResolver {
    executions: Arc<dyn ExecutionStore>,
    /// Global staleness window in seconds; `None` accepts any past success.
    default_staleness_secs: Option<u64>,
}

impl DependencyResolver {
    #[must_use]
    pub fn new(executions: Arc<dyn ExecutionStore>, default_staleness_secs: Option<u64>) -> Self {
        Self {
            executions,
            default_staleness_secs,
        }
    }

    /// Check every prerequisite. `staleness_secs` overrides the global window.
    pub async fn check(
        &self,
        prerequisites: &[String],
        staleness_secs: Option<u64>,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<DependencyCheck> {
        let window = staleness_secs
            .or(self.default_staleness_secs)
            .and_then(|secs| TimeDelta::try_seconds(i64::try_from(secs).ok()?));

        let mut check = DependencyCheck::default();
        for pipeline_id in prerequisites {
            let latest = self.executions.latest_for_pipeline(pipeline_id).await?;
            let reason = match latest {
                None => Some(UnmetReason::NeverRun),
                Some(execution) if execution.status != ExecutionStatus::Completed => {
                    Some(UnmetReason::NotCompleted {
                        status: execution.status,
                    })
                }
                Some(execution) => match (window, execution.ended_at) {
                    (Some(window), Some(ended_at)) if now - ended_at > window => {
                        Some(UnmetReason::Stale { ended_at })
                    }
                    _ => None,
                },
            };

            if let Some(reason) = reason {
                check.unmet.push(UnmetDependency {
                    pipeline_id: pipeline_id.clone(),
                    reason,
                });
            }
        }
        Ok(check)
    }
}

impl fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyResolver")
            .field("default_staleness_secs", &self.default_staleness_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_store::{Execution, InMemoryExecutionStore, Parameters, TransitionUpdate};

    async fn finished(
        store: &InMemoryExecutionStore,
        pipeline: &str,
        status: ExecutionStatus,
        at: DateTime<Utc>,
    ) {
        let execution = store
            .create(Execution::manual(pipeline, Parameters::new()))
            .await
            .unwrap();
        let update = TransitionUpdate {
            at,
            ..TransitionUpdate::now()
        };
        store.transition(&execution.id, status, update).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_prerequisites_is_satisfied() {
        let resolver = DependencyResolver::new(Arc::new(InMemoryExecutionStore::new()), None);
        let check = resolver.check(&[], None, Utc::now()).await.unwrap();
        assert!(check.is_satisfied());
    }

    #[tokio::test]
    async fn test_latest_execution_decides() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let now = Utc::now();
        finished(&store, "extract", ExecutionStatus::Completed, now).await;
        finished(&store, "extract", ExecutionStatus::Failed, now).await;

        let resolver = DependencyResolver::new(store, None);
        let check = resolver
            .check(&["extract".to_string(), "clean".to_string()], None, now)
            .await
            .unwrap();

        assert!(!check.is_satisfied());
        assert_eq!(
            check.unmet[0].reason,
            UnmetReason::NotCompleted {
                status: ExecutionStatus::Failed
            }
        );
        assert_eq!(check.unmet[1].reason, UnmetReason::NeverRun);
        assert_eq!(check.unmet[1].to_string(), "clean has never run");
    }

    #[tokio::test]
    async fn test_staleness_window_and_override() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let now = Utc::now();
        let ended = now - TimeDelta::hours(2);
        finished(&store, "extract", ExecutionStatus::Completed, ended).await;

        let prereqs = vec!["extract".to_string()];

        let unlimited = DependencyResolver::new(Arc::clone(&store) as Arc<dyn ExecutionStore>, None);
        assert!(unlimited.check(&prereqs, None, now).await.unwrap().is_satisfied());

        let hourly = DependencyResolver::new(store, Some(3600));
        let check = hourly.check(&prereqs, None, now).await.unwrap();
        assert_eq!(check.unmet[0].reason, UnmetReason::Stale { ended_at: ended });

        // A per-schedule window wins over the global one.
        assert!(hourly
            .check(&prereqs, Some(3 * 3600), now)
            .await
            .unwrap()
            .is_satisfied());
    }
}
