use anyhow::Context;
use kinesis_shard_telemetry::{
    ConsumerSubsystem, MetricsSubsystem, Orchestrator, ServiceConfig, ShardMetricsRegistry,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let config = ServiceConfig::from_env().context("Failed to load configuration")?;
    info!(
        app = %config.application_name,
        stream = %config.stream_name,
        worker_id = %config.worker_id,
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );

    let registry = Arc::new(ShardMetricsRegistry::new()?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!(error = %e, "Unable to listen for interrupt signal"),
        }
    });

    let bootstrap = Orchestrator::new()
        .with_subsystem(MetricsSubsystem::new(
            registry.clone(),
            config.metrics_port,
            shutdown_rx.clone(),
        ))
        .with_subsystem(ConsumerSubsystem::new(config, registry, shutdown_rx))
        .start()
        .await;

    if bootstrap.running().is_empty() {
        anyhow::bail!("No subsystem could be started");
    }

    let exits = bootstrap.wait().await;
    for exit in exits.iter().filter(|exit| exit.result.is_err()) {
        error!(subsystem = exit.name, "Subsystem ended with an error");
    }

    info!("Shutdown complete");
    Ok(())
}
