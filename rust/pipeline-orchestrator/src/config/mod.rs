//! Configuration management for the pipeline orchestrator.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. `config/pipeline-orchestrator.{yaml,toml,json}` when present
//! 3. An explicit file passed to [`AppConfig::from_file`]
//! 4. Environment variables prefixed `PIPELINE__`, nested with `__`
//!    (e.g. `PIPELINE__SCHEDULER__INTERVAL_SECS=30`)
//!
//! A `.env` file is read first when present.
//!
//! ```rust,ignore
//! use pipeline_orchestrator::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! let settings = config.orchestrator_settings();
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::orchestrator::OrchestratorSettings;
use crate::pipeline::PipelineSpec;
use crate::retry::RetryPolicy;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub dependencies: DependencyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Pipelines known to the registry at startup.
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate configuration from the default sources.
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::load_unchecked()?;
        config.validated()
    }

    /// Load configuration without validation.
    pub fn load_unchecked() -> anyhow::Result<Self> {
        Self::build(None)
    }

    /// Load and validate configuration with `path` layered over the default
    /// file and under the environment.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = Self::build(Some(path.as_ref()))?;
        config.validated()
    }

    fn validated(self) -> anyhow::Result<Self> {
        ConfigValidator::validate(&self)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;
        Ok(self)
    }

    fn build(explicit: Option<&Path>) -> anyhow::Result<Self> {
        // Missing .env is the normal case.
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/pipeline-orchestrator").required(false));
        if let Some(path) = explicit {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("PIPELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Runtime settings for [`Orchestrator`](crate::Orchestrator).
    #[must_use]
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            interval: Duration::from_secs(self.scheduler.interval_secs),
            run_immediately: self.scheduler.run_immediately,
            tick_timeout: Duration::from_secs(self.scheduler.tick_timeout_secs),
            dependency_timeout: Duration::from_secs(self.scheduler.dependency_timeout_secs),
            advance_on_dependency_skip: self.scheduler.advance_on_dependency_skip,
            dispatch_timeout: Duration::from_secs(self.dispatch.timeout_secs),
            cancel_grace: Duration::from_secs(self.dispatch.cancel_grace_secs),
            retry: self.retry,
            dependency_staleness_secs: self.dependencies.staleness_secs,
        }
    }
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between ticks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Tick once as soon as the loop starts.
    #[serde(default)]
    pub run_immediately: bool,
    /// Upper bound for one tick.
    #[serde(default = "default_tick_timeout_secs")]
    pub tick_timeout_secs: u64,
    /// Upper bound for one prerequisite check.
    #[serde(default = "default_dependency_timeout_secs")]
    pub dependency_timeout_secs: u64,
    /// Move `next_run` forward when prerequisites block a firing.
    #[serde(default = "default_true")]
    pub advance_on_dependency_skip: bool,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_tick_timeout_secs() -> u64 {
    300
}

fn default_dependency_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            run_immediately: false,
            tick_timeout_secs: default_tick_timeout_secs(),
            dependency_timeout_secs: default_dependency_timeout_secs(),
            advance_on_dependency_skip: true,
        }
    }
}

/// Where pipeline runs are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchBackend {
    /// In-process worker pool.
    #[default]
    Local,
    /// Redis list consumed by external workers.
    Redis,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub backend: DispatchBackend,
    /// Upper bound for one submit or cancel call.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub timeout_secs: u64,
    /// Local pool size.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// How long an unconfirmed cancellation waits before it is recorded.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    pub redis_url: Option<String>,
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    4
}

fn default_cancel_grace_secs() -> u64 {
    60
}

fn default_queue_prefix() -> String {
    "pipeline".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backend: DispatchBackend::default(),
            timeout_secs: default_dispatch_timeout_secs(),
            max_concurrent: default_max_concurrent(),
            cancel_grace_secs: default_cancel_grace_secs(),
            redis_url: None,
            queue_prefix: default_queue_prefix(),
        }
    }
}

/// Prerequisite resolution configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Oldest acceptable prerequisite completion, in seconds.
    #[serde(default)]
    pub staleness_secs: Option<u64>,
}

/// Record store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub path: Option<PathBuf>,
}

#[allow(clippy::unnecessary_wraps, reason = "serde default for an optional field")]
fn default_storage_path() -> Option<PathBuf> {
    Some(PathBuf::from("./pipeline-orchestrator.db"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

/// A pipeline declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Program and arguments run by the local dispatcher.
    #[serde(default)]
    pub command: Vec<String>,
}

impl PipelineConfig {
    #[must_use]
    pub fn to_spec(&self) -> PipelineSpec {
        PipelineSpec {
            id: self.id.clone(),
            description: self.description.clone(),
            prerequisites: self.prerequisites.clone(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
