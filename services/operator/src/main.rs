//! Fleet operator
//!
//! Keeps a pool of pre-warmed game server instances per build, manages
//! their host ports and lifecycle, and serves session allocations over
//! HTTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet_operator::{
    api, config, metrics,
    model::Node,
    operator::Operator,
    store::{MemoryStore, ObjectStore, PlacementWorker},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const PLACEMENT_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet operator");
    info!(
        listen_addr = %config.listen_addr,
        min_port = config.min_port,
        max_port = config.max_port,
        "Configuration loaded"
    );

    let metrics = match metrics::init() {
        Ok(metrics) => metrics,
        Err(e) => {
            error!(error = %e, "Failed to register metrics");
            return Err(e.into());
        }
    };

    // In-process store with a fixed node pool
    let store = Arc::new(MemoryStore::new());
    for i in 0..config.dev_nodes {
        store.add_node(Node::new(format!("dev-node-{i}"), "127.0.0.1")).await;
    }
    info!(nodes = config.dev_nodes, "In-process store ready");

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let operator = Operator::start(
        &config,
        store.clone() as Arc<dyn ObjectStore>,
        metrics,
        shutdown_rx.clone(),
    )
    .await?;

    // Stand in for the cluster scheduler
    let placement = PlacementWorker::new(store, PLACEMENT_INTERVAL);
    let placement_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            placement.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(operator.state().clone());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    operator.join(shutdown_timeout).await;

    if let Err(e) = tokio::time::timeout(shutdown_timeout, placement_handle).await {
        warn!(error = %e, "Placement worker did not shut down in time");
    }

    info!("Fleet operator shutdown complete");
    Ok(())
}
