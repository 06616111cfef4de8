mod cli;
mod exporter;
mod worker;

use std::sync::Arc;

use clap::Parser;
use fanin_metrics::{Collector, MetricsRecorder, MetricsRegistry, WorkerMetrics};
use fanin_storage::{BackendRegistry, ProcessTable, SystemProcessTable, current_process};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, ExporterArgs, StorageArgs, WorkerArgs};
use crate::exporter::{ExporterState, exporter_router, spawn_reaper};
use crate::worker::{WorkerState, worker_router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::from_default_env().add_directive("fanin=info".parse()?);
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Command::Exporter(args) => run_exporter(&cli.storage, args).await,
        Command::Worker(args) => run_worker(&cli.storage, args).await,
    }
}

async fn run_exporter(
    storage: &StorageArgs,
    args: ExporterArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let store_config = storage.store_config()?;
    let collector_config = args.collector_config()?;
    let process = current_process();
    let store = BackendRegistry::with_available_backends()
        .open(&store_config, process)
        .await?;
    let processes: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());

    let reaper = args
        .reap_interval()
        .map(|every| spawn_reaper(Arc::clone(&store), Arc::clone(&processes), every));
    if reaper.is_some() {
        info!("dead process sweep enabled");
    }

    let state = Arc::new(ExporterState {
        collector: Collector::new(vec![Arc::clone(&store)], processes, collector_config),
        store,
    });
    let app = exporter_router(state);

    let addr = args.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(process = %process, "fanin exporter listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    Ok(())
}

async fn run_worker(
    storage: &StorageArgs,
    args: WorkerArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let store_config = storage.store_config()?;
    let process = current_process();
    let store = BackendRegistry::with_available_backends()
        .open(&store_config, process)
        .await?;

    let registry = Arc::new(MetricsRegistry::new(store));
    let recorder: Arc<dyn MetricsRecorder> = Arc::new(WorkerMetrics::register(registry)?);
    recorder.worker_started().await;

    let app = worker_router(Arc::new(WorkerState {
        recorder: Arc::clone(&recorder),
    }));

    let addr = args.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(process = %process, "fanin worker listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    recorder.worker_exiting().await;
    info!(process = %process, "fanin worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => {
            warn!(error = %err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
