//! Wiring an [`Orchestrator`] from [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use pipeline_store::Stores;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, DispatchBackend, StorageBackend};
use crate::dispatcher::{
    status_channel, CommandRunner, LocalDispatcher, RedisQueueDispatcher, TaskDispatcher,
};
use crate::logging::OpTimer;
use crate::orchestrator::Orchestrator;
use crate::pipeline::PipelineRegistry;
use crate::{log_init_step, log_init_warning, log_success};

const INIT_STEPS: u32 = 4;

/// A running orchestrator and the background tasks feeding it.
#[derive(Debug)]
pub struct App {
    pub orchestrator: Orchestrator,
    listener: JoinHandle<()>,
    event_pump: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

/// Open the stores, build the dispatcher and start consuming worker events.
///
/// The scheduler loop is not started.
pub async fn build_app(config: &AppConfig) -> anyhow::Result<App> {
    let stores = open_stores(config).await?;

    let registry = PipelineRegistry::new();
    for pipeline in &config.pipelines {
        registry.register(pipeline.to_spec());
    }
    log_init_step!(2, INIT_STEPS, "Pipelines", format!("{} registered", registry.len()));

    let shutdown = CancellationToken::new();
    let (status_tx, status_rx) = status_channel();
    let (dispatcher, event_pump) = match config.dispatch.backend {
        DispatchBackend::Local => {
            let local = LocalDispatcher::new(status_tx, config.dispatch.max_concurrent);
            for pipeline in &config.pipelines {
                if pipeline.command.is_empty() {
                    log_init_warning!("Pipeline '{}' has no command and cannot run locally", pipeline.id);
                    continue;
                }
                local.register_runner(&pipeline.id, Arc::new(CommandRunner::new(&pipeline.command)?));
            }
            log_init_step!(
                3,
                INIT_STEPS,
                "Dispatcher",
                format!("local pool, {} slots", config.dispatch.max_concurrent)
            );
            (Arc::new(local) as Arc<dyn TaskDispatcher>, None)
        }
        DispatchBackend::Redis => {
            let url = config
                .dispatch
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("dispatch.redis_url is required for the redis backend"))?;
            let timer = OpTimer::new("dispatcher", "redis_connect");
            let connected = RedisQueueDispatcher::connect(url, config.dispatch.queue_prefix.clone()).await;
            timer.finish_with_result(connected.as_ref());
            let redis = connected?;
            let pump = redis.spawn_event_pump(status_tx, shutdown.child_token());
            log_init_step!(3, INIT_STEPS, "Dispatcher", format!("redis queue {}", redis.keys().queue()));
            (Arc::new(redis) as Arc<dyn TaskDispatcher>, Some(pump))
        }
    };

    let orchestrator = Orchestrator::new(registry, stores, dispatcher, config.orchestrator_settings());
    let listener = orchestrator.listen(status_rx);
    log_init_step!(4, INIT_STEPS, "Orchestrator", "listening for worker events");
    log_success!("Pipeline orchestrator ready");

    Ok(App {
        orchestrator,
        listener,
        event_pump,
        shutdown,
    })
}

async fn open_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    let stores = match config.storage.backend {
        StorageBackend::Memory => {
            log_init_warning!("In-memory storage: schedules and history are lost on exit");
            log_init_step!(1, INIT_STEPS, "Storage", "memory");
            Stores::in_memory()
        }
        StorageBackend::Sqlite => {
            let path = config
                .storage
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("storage.path is required for the sqlite backend"))?;
            let timer = OpTimer::new("storage", "sqlite_open");
            let opened = Stores::sqlite(path.clone()).await;
            timer.finish_with_result(opened.as_ref());
            log_init_step!(1, INIT_STEPS, "Storage", format!("sqlite at {}", path.display()));
            opened?
        }
    };
    Ok(stores)
}

impl App {
    /// Wait until every listed execution is terminal or `timeout` passes.
    ///
    /// Returns whether all of them finished.
    pub async fn wait_for(&self, execution_ids: &[String], timeout: Duration) -> anyhow::Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let executions = futures::future::try_join_all(
                execution_ids.iter().map(|id| self.orchestrator.get_execution(id)),
            )
            .await?;
            let pending = executions.iter().filter(|e| !e.is_terminal()).count();
            if pending == 0 {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(pending, "Executions still running at deadline");
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Stop the scheduler loop and the background tasks.
    pub async fn shutdown(self) {
        self.orchestrator.stop().await;
        self.shutdown.cancel();
        if let Some(pump) = self.event_pump {
            if let Err(e) = pump.await {
                tracing::warn!(error = %e, "Redis event pump ended abnormally");
            }
        }
        self.listener.abort();
        tracing::info!("Pipeline orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use pipeline_store::Parameters;

    fn local_config(pipelines: Vec<PipelineConfig>) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config.pipelines = pipelines;
        config
    }

    #[tokio::test]
    async fn test_build_registers_configured_pipelines() {
        let config = local_config(vec![
            PipelineConfig {
                id: "extract".to_string(),
                description: None,
                prerequisites: vec![],
                command: vec!["true".to_string()],
            },
            PipelineConfig {
                id: "report".to_string(),
                description: Some("weekly report".to_string()),
                prerequisites: vec!["extract".to_string()],
                command: vec![],
            },
        ]);

        let app = build_app(&config).await.unwrap();
        let pipelines = app.orchestrator.list_pipelines();
        assert_eq!(pipelines.len(), 2);
        assert_eq!(pipelines[1].prerequisites, vec!["extract"]);
        app.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_command_run_completes() {
        let config = local_config(vec![PipelineConfig {
            id: "extract".to_string(),
            description: None,
            prerequisites: vec![],
            command: vec!["sh".to_string(), "-c".to_string(), "echo loaded".to_string()],
        }]);

        let app = build_app(&config).await.unwrap();
        let execution = app
            .orchestrator
            .run_pipeline_now("extract", Parameters::new())
            .await
            .unwrap();
        assert!(app
            .wait_for(&[execution.id.clone()], Duration::from_secs(10))
            .await
            .unwrap());

        // The completion message is logged just after the status flips.
        let mut logged = false;
        for _ in 0..50 {
            let logs = app.orchestrator.execution_logs(&execution.id).await.unwrap();
            if logs.iter().any(|entry| entry.line == "loaded") {
                logged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(logged, "completion message never reached the execution log");
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_pipeline_without_command_fails_to_enqueue() {
        let config = local_config(vec![PipelineConfig {
            id: "report".to_string(),
            description: None,
            prerequisites: vec![],
            command: vec![],
        }]);

        let app = build_app(&config).await.unwrap();
        let execution = app
            .orchestrator
            .run_pipeline_now("report", Parameters::new())
            .await
            .unwrap();
        assert_eq!(execution.status, pipeline_store::ExecutionStatus::Failed);
        assert!(execution.error.unwrap().contains("no runner registered"));
        app.shutdown().await;
    }
}
