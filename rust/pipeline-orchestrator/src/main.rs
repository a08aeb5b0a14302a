//! Pipeline Orchestrator - daemon entry point.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use pipeline_orchestrator::app::build_app;
use pipeline_orchestrator::config::{AppConfig, DispatchBackend};
use pipeline_orchestrator::logging::init_tracing;
use pipeline_orchestrator::{log_banner, ScheduleOutcome};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "pipeline-orchestrator")]
#[command(about = "Cron-driven scheduler and run tracker for data pipelines")]
#[command(version)]
struct Args {
    /// Config file layered over config/pipeline-orchestrator.*.
    #[arg(short, long, env = "PIPELINE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding logging.level.
    #[arg(long, env = "PIPELINE_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the scheduler loop until interrupted (default).
    Serve,
    /// Evaluate all schedules once and print the summary as JSON.
    Tick {
        /// Treat every enabled schedule as due.
        #[arg(long)]
        force: bool,
    },
}

/// How long `tick` waits for locally dispatched runs.
const TICK_DRAIN_TIMEOUT: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::load()?,
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.json = true;
    }
    init_tracing(&config.logging);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Tick { force } => tick(config, force).await,
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    log_banner!(
        format!("Pipeline Orchestrator v{}", env!("CARGO_PKG_VERSION")),
        format!(
            "interval {}s, dispatch {:?}, storage {:?}",
            config.scheduler.interval_secs, config.dispatch.backend, config.storage.backend
        )
    );

    let app = build_app(&config).await?;
    let settings = app.orchestrator.settings().clone();
    app.orchestrator.start(settings.interval, settings.run_immediately);

    shutdown_signal().await;
    app.shutdown().await;
    Ok(())
}

async fn tick(config: AppConfig, force: bool) -> anyhow::Result<()> {
    let app = build_app(&config).await?;
    let summary = app.orchestrator.run_once(force).await?;

    // Local runs live in this process; let them finish before exiting.
    if config.dispatch.backend == DispatchBackend::Local {
        let dispatched: Vec<String> = summary
            .outcomes
            .iter()
            .filter_map(|report| match &report.outcome {
                ScheduleOutcome::Dispatched { execution_id } => Some(execution_id.clone()),
                _ => None,
            })
            .collect();
        app.wait_for(&dispatched, TICK_DRAIN_TIMEOUT).await?;
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    app.shutdown().await;
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
