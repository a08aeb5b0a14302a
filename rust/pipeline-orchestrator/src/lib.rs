//! Pipeline Orchestrator - cron-driven scheduling for data pipelines
//!
//! This crate decides when registered pipelines run, hands each run to a
//! worker pool through a [`TaskDispatcher`](dispatcher::TaskDispatcher), and
//! tracks every run as an execution record until it finishes.
//!
//! - **Cron**: five-field expressions evaluated in UTC
//! - **Dependencies**: a pipeline can require other pipelines to have
//!   completed recently before it is scheduled
//! - **Retries**: failed runs are retried as new execution records linked by
//!   a correlation id
//! - **Dispatch**: an in-process worker pool or a Redis list consumed by
//!   external workers
//!
//! # Architecture
//!
//! - [`cron`]: expression parsing and trigger computation
//! - [`pipeline`]: the pipeline registry
//! - [`dependency`]: prerequisite resolution
//! - [`retry`]: retry policy and backoff
//! - [`dispatcher`]: task dispatchers and worker status events
//! - [`scheduler`]: the interval loop and tick summaries
//! - [`orchestrator`]: the façade tying the above to the stores
//! - [`config`] and [`logging`]: ambient setup for the daemon
//!
//! # Example
//!
//! ```rust,ignore
//! use pipeline_orchestrator::{config::AppConfig, app::build_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let app = build_app(&config).await?;
//!     let summary = app.orchestrator.run_once(false).await?;
//!     println!("{}", serde_json::to_string_pretty(&summary)?);
//!     app.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod cron;
pub mod dependency;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod scheduler;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{
    CreateSchedule, ExecutionEvent, Orchestrator, OrchestratorSettings, SchedulePatch,
};
pub use pipeline::{PipelineRegistry, PipelineSpec};
pub use scheduler::{LoopState, ScheduleOutcome, SchedulerStatus, TickSummary};
