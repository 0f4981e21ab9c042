//! replug worker daemon
//!
//! Connects to the orchestration service, serves the configured task queue,
//! and hot-swaps plugin code as new artifacts appear on disk or on the
//! package feed.

use clap::Parser;
use replug_core::coordinator::ReloadCoordinator;
use replug_core::loader::{ArtifactLoader, LoaderConfig};
use replug_core::registry::ArtifactRegistry;
use replug_core::watcher::{FeedPoller, FileSystemWatcher, PluginSourceWatcher};
use replug_core::worker::{ManagerConfig, WorkerLifecycleManager};
use replug_core::{Config, OrchestratorClient, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

mod baseline;
mod health;

/// Hot-reloading orchestration worker.
#[derive(Parser)]
#[command(name = "replug-worker", about = "Hot-reloading orchestration worker")]
struct Cli {
    /// Orchestration service address (host:port). Overrides TEMPORAL_SERVER.
    #[arg(long)]
    server: Option<String>,

    /// Task queue to poll. Overrides TASK_QUEUE.
    #[arg(long)]
    queue: Option<String>,

    /// Health endpoint port, 0 to disable. Overrides HEALTH_PORT.
    #[arg(long)]
    health_port: Option<u16>,

    /// Directory to watch for plugin modules (repeatable). Overrides
    /// HOT_RELOAD_WATCH_PATHS.
    #[arg(long)]
    watch_path: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = run().await {
        tracing::error!(%error, "fatal error, exiting");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(queue) = cli.queue {
        config.task_queue = queue;
    }
    if let Some(port) = cli.health_port {
        config.health_port = port;
    }
    if !cli.watch_path.is_empty() {
        config.watch_paths = cli.watch_path;
    }

    info!(
        server = %config.server,
        queue = %config.task_queue,
        hot_reload = config.hot_reload_enabled,
        mode = ?config.mode,
        "starting replug worker"
    );

    let registry = Arc::new(ArtifactRegistry::new());
    let loader = Arc::new(ArtifactLoader::new(LoaderConfig::from_config(&config))?);
    let coordinator = Arc::new(ReloadCoordinator::new(
        loader,
        registry,
        config.quiesce_delay,
    ));

    let (trigger_tx, trigger_rx) = mpsc::channel(16);
    let mut watchers: Vec<Box<dyn PluginSourceWatcher>> = Vec::new();

    if config.hot_reload_enabled {
        if config.mode.includes_filesystem() && !config.watch_paths.is_empty() {
            watchers.push(Box::new(FileSystemWatcher::new(
                config.watch_paths.clone(),
                &config.file_filter,
                config.exclude_prefixes.clone(),
                config.debounce,
                trigger_tx.clone(),
            )?));
        }
        if config.mode.includes_feed() {
            if let Some(feed) = config.feed.clone() {
                watchers.push(Box::new(FeedPoller::new(feed, trigger_tx.clone())?));
            }
        }

        for watcher in &watchers {
            watcher.start().await?;
            info!(source = watcher.name(), "plugin source watcher started");
        }
        coordinator.start(trigger_rx);
    } else {
        info!("hot reload disabled, serving the startup registration only");
    }
    drop(trigger_tx);

    let initial = coordinator.initial_load().await?;
    info!(
        tasks = initial.task_count(),
        workflows = initial.workflow_count(),
        "initial plugin scan complete"
    );

    let client = OrchestratorClient::connect(&config.server).await?;
    let manager = Arc::new(WorkerLifecycleManager::new(
        client,
        ManagerConfig::from_config(&config),
        baseline::baseline_registration(),
    ));
    manager.start(initial).await?;
    let _reload_listener = manager.spawn_reload_listener(coordinator.subscribe());

    if config.health_port != 0 {
        let state = health::HealthState::new(manager.clone());
        tokio::spawn(health::serve(config.health_port, state));
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(replug_core::ReplugError::Io)?;
    info!("shutdown signal received, draining");

    for watcher in &watchers {
        watcher.stop().await;
    }
    coordinator.stop();
    manager.stop(None).await;

    info!("shutdown complete");
    Ok(())
}
