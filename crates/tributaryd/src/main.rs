//! tributary daemon
//!
//! Usage:
//!   tributaryd [config.yaml]
//!
//! Loads the YAML configuration, verifies the source server (grants, binlog
//! settings), opens the replication session from the persisted position, and
//! runs the pipeline until SIGINT/SIGTERM.

use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tributaryd::{Cli, Config};

use tributary::common::PositionStore;
use tributary::mysql::{check_source, BinlogSource, RowEventBuilder, SchemaResolver};
use tributary::sink::{NatsSink, ScriptBus};
use tributary::{Pipeline, Transformer};

/// Bound on graceful shutdown once the signal arrives.
const SHUTDOWN_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e:#}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(config).await {
        tracing::error!("Startup failed: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let source_config = config.source_config();

    if config.binlog.start_timestamp > 0 {
        tracing::info!(
            "binlog.start_timestamp is set ({}) but positioning uses the position file",
            config.binlog.start_timestamp
        );
    }

    // Pre-flight: fail before touching the replication protocol.
    check_source(&source_config).await?;

    let sink = Arc::new(NatsSink::connect(&config.sink_config()).await?);

    let transformer = Transformer::from_config(
        &config.transformer,
        Some(sink.clone() as Arc<dyn ScriptBus>),
    )?;

    let store = PositionStore::new(
        config.binlog.position_file.clone(),
        config.binlog.start_position,
    );
    let source = BinlogSource::connect(source_config.clone(), store).await?;
    let schema = SchemaResolver::new(&source_config);
    let builder = RowEventBuilder::new(config.binlog.lenient_text_detection);

    let mut pipeline = Pipeline::new(source, schema, builder, transformer, sink.clone());

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received, initiating graceful shutdown");
        let _ = signal_tx.send(());
    });

    let mut pipeline_handle = tokio::spawn(async move { pipeline.run(shutdown_rx).await });

    let mut done_rx = shutdown_tx.subscribe();
    tokio::select! {
        result = &mut pipeline_handle => {
            match result {
                Ok(Ok(())) => tracing::info!("Pipeline exited"),
                Ok(Err(e)) => anyhow::bail!("pipeline failed: {e}"),
                Err(e) => anyhow::bail!("pipeline task panicked: {e}"),
            }
        }
        _ = done_rx.recv() => {
            // the pipeline observes the same channel; give it a bounded
            // window to flush its position and exit
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut pipeline_handle).await {
                Ok(Ok(Ok(()))) => tracing::info!("Pipeline shut down gracefully"),
                Ok(Ok(Err(e))) => tracing::error!("Pipeline error during shutdown: {e}"),
                Ok(Err(e)) => tracing::error!("Pipeline task panicked: {e}"),
                Err(_) => {
                    tracing::warn!("Shutdown timed out after {SHUTDOWN_TIMEOUT:?}, forcing exit");
                    pipeline_handle.abort();
                }
            }
        }
    }

    if let Err(e) = sink.flush().await {
        tracing::warn!("Failed to flush sink: {e}");
    }

    tracing::info!("Goodbye");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
