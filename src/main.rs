//! Gossiping daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

mod codec;
mod config;
mod fingerprint;
mod gossip;
mod http;
mod probe;
mod reconciler;
mod state;
mod store;
mod task;
mod types;

use config::Config;
use gossip::{run_gossip, Peers, Publisher};
use http::{run_http_server, AppState};
use probe::{IcmpProber, Resolver};
use reconciler::Reconciler;
use state::StateWriter;
use store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting gossiping daemon in cluster {} with {} bootstrap peers",
        cfg.cluster.cluster_name,
        cfg.cluster.bootstrap_peers.len()
    );

    let store = Arc::new(Store::new());
    let registry = prometheus::Registry::new();

    // Monitor tasks
    let reconciler = Reconciler::new(
        Arc::new(IcmpProber::new(Resolver::from_system_conf(), cfg.tasks.ttl)),
        cfg.tasks.options(),
        cfg.global.external_labels.clone(),
    );
    registry.register(Box::new(reconciler.clone()))?;
    if cfg.tasks.dry_run {
        info!("Dry run is enabled for tasks");
    } else {
        store
            .register_observer("reconciler", Arc::new(reconciler.clone()))
            .await;
    }

    // File SD states
    if let Some(dir) = &cfg.tasks.states {
        info!("Task states are written to {}", dir.display());
        tokio::fs::create_dir_all(dir).await?;
        store
            .register_observer("state", Arc::new(StateWriter::new(dir)))
            .await;
    }

    // Update channel
    let (publish_tx, publish_rx) = mpsc::channel(128);
    let peers = Peers::default();

    // Gossip Subsystem
    let store_for_gossip = Arc::clone(&store);
    let peers_for_gossip = Arc::clone(&peers);
    let cluster = cfg.cluster.clone();
    let gossip_handle = tokio::spawn(async move {
        if let Err(e) = run_gossip(cluster, store_for_gossip, publish_rx, peers_for_gossip).await {
            error!("Gossip subsystem failed: {}", e);
        }
    });

    // HTTP Server
    let app = AppState {
        publisher: Publisher::new(Arc::clone(&store), publish_tx),
        store: Arc::clone(&store),
        registry,
        peers,
    };
    let listen = cfg.http.listen;
    let http_handle = tokio::spawn(async move {
        if let Err(e) = run_http_server(listen, app).await {
            error!("HTTP server failed: {}", e);
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    http_handle.abort();
    gossip_handle.abort();

    let stopped = reconciler.shutdown();
    for task in &stopped {
        task.wait().await;
    }
    if !stopped.is_empty() {
        info!("Stopped {} monitor tasks", stopped.len());
    }

    info!("Shutdown complete.");
    Ok(())
}
