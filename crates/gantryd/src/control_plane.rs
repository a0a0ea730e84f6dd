//! Control plane mode — the panel.
//!
//! Assembles the inventory store, placement engine, orchestrator, and node
//! manager, serves the REST API, and runs the node liveness sweep.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use gantry_orchestrator::{HttpNodeTransport, NodeManager, Orchestrator};
use gantry_placement::PlacementEngine;

/// Run the panel.
pub async fn run_panel(
    port: u16,
    data_dir: PathBuf,
    remote_base: Option<String>,
    node_stale_after: u64,
    sweep_interval: u64,
    request_timeout: u64,
) -> anyhow::Result<()> {
    info!("Gantry panel starting");
    std::fs::create_dir_all(&data_dir)?;

    // ── State store ────────────────────────────────────────────
    let db_path = data_dir.join("gantry.redb");
    let state = gantry_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Placement + lifecycle ──────────────────────────────────
    let placement = PlacementEngine::new(state.clone());
    let transport = Arc::new(HttpNodeTransport::new(Duration::from_secs(request_timeout)));
    let orchestrator = Arc::new(Orchestrator::new(state.clone(), placement, transport));
    let nodes = NodeManager::new(state.clone());
    info!("orchestrator initialized");

    let remote_base = remote_base.unwrap_or_else(|| {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        format!("http://{host}:{port}")
    });

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // ── Node liveness sweep ────────────────────────────────────
    let sweep_nodes = nodes.clone();
    let sweep_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sweep_nodes.mark_stale_nodes(node_stale_after) {
                        Ok(0) => {}
                        Ok(n) => info!(count = n, "nodes marked offline"),
                        Err(err) => warn!(%err, "node liveness sweep failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    });

    // ── REST API ───────────────────────────────────────────────
    let router = gantry_api::build_router(gantry_api::ApiState {
        orchestrator,
        nodes,
        store: state,
        remote_base,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = sweep_handle.await;
    info!("Gantry panel stopped");
    Ok(())
}
