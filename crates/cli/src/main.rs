//! `conveyor` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`        — start the webhook ingress and orchestration core.
//! - `check-config` — resolve configuration from the environment and print
//!                    the non-secret view.

mod backend;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use bus::{BusConfig, EventBus};
use engine::{
    PrCreationWorkflow, TaskProcessingWorkflow, ValidationWorkflow, WorkflowEngine,
};
use ingress::{AppState, IngressConfig, RateLimiter, SignatureVerifier};
use processor::{EventProcessor, WorkflowDispatchHandler};
use store::{EventSource, EventStore, InMemoryEventStore};
use validation::{ValidationExecutor, WorkspaceManager};

use crate::backend::ExecutorBackend;
use crate::config::CoreConfig;

/// How long shutdown waits for active workflows to drain.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "conveyor", about = "CI/CD automation core", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the ingress server and orchestration core.
    Serve {
        /// Override HOST:PORT from the environment.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Resolve configuration and print the non-secret feature flags.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = CoreConfig::from_env().context("resolving configuration")?;

    match cli.command {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.bind_addr());
            serve(bind, config).await
        }
        Command::CheckConfig => {
            println!(
                "{}",
                serde_json::to_string_pretty(&config.ingress.feature_flags())?
            );
            Ok(())
        }
    }
}

async fn serve(bind: String, config: CoreConfig) -> anyhow::Result<()> {
    let bus = EventBus::new(BusConfig::default());
    let store: Arc<InMemoryEventStore> = Arc::new(InMemoryEventStore::new());

    // Validation executor and its janitor.
    let workspaces = Arc::new(WorkspaceManager::new(config.workspace.clone()));
    let executor = ValidationExecutor::new(config.executor.clone(), workspaces);
    executor.spawn_janitor();

    // Engine with the three built-in kinds; validation runs through the
    // real executor via the capability adapter.
    let engine = WorkflowEngine::new(bus.clone(), config.engine.clone());
    engine
        .register(Arc::new(ValidationWorkflow::with_backend(ExecutorBackend::new(
            executor.clone(),
        ))))
        .await?;
    engine.register(Arc::new(TaskProcessingWorkflow::new())).await?;
    engine.register(Arc::new(PrCreationWorkflow::new())).await?;

    // Processor with the per-source dispatch handlers.
    let processor =
        EventProcessor::new(store.clone(), bus.clone(), config.processor.clone());
    processor
        .register_handler(
            EventSource::SourceHost,
            Arc::new(WorkflowDispatchHandler::source_host(engine.clone())),
        )
        .await;
    processor
        .register_handler(
            EventSource::IssueTracker,
            Arc::new(WorkflowDispatchHandler::issue_tracker(engine.clone())),
        )
        .await;
    processor
        .register_handler(
            EventSource::Agent,
            Arc::new(WorkflowDispatchHandler::agent(engine.clone())),
        )
        .await;

    spawn_store_cleanup(store.clone(), config.cleanup_interval, config.event_ttl);

    let ingress_config: Arc<IngressConfig> = Arc::new(config.ingress);
    let state = AppState {
        store: store.clone(),
        processor,
        engine: engine.clone(),
        executor: Some(executor),
        bus: bus.clone(),
        verifier: Arc::new(SignatureVerifier::from_config(&ingress_config)),
        limiter: Arc::new(RateLimiter::new(config.rate_limits.clone())),
        config: ingress_config,
    };

    info!(%bind, "starting conveyor");
    ingress::serve(&bind, state, shutdown_signal(bus, engine))
        .await
        .context("ingress server failed")?;

    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGTERM/SIGINT after cancelling active workflows and
/// draining for up to 30 s.
async fn shutdown_signal(bus: EventBus, engine: Arc<WorkflowEngine>) {
    wait_for_signal().await;
    info!("shutdown signal received; cancelling active workflows");

    bus.publish("system.shutdown", serde_json::json!({}), false).await;

    let drain_deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
    loop {
        if engine.active_count().await == 0 {
            break;
        }
        if tokio::time::Instant::now() >= drain_deadline {
            let remaining = engine.active_count().await;
            warn!(remaining, "drain window elapsed with workflows still active");
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn spawn_store_cleanup(store: Arc<InMemoryEventStore>, interval: Duration, ttl: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store
                .cleanup(chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(24)))
                .await
            {
                Ok(0) => {}
                Ok(evicted) => info!(evicted, "event store TTL sweep"),
                Err(err) => warn!(%err, "event store cleanup failed"),
            }
        }
    });
}
