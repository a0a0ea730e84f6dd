//! Agent mode — runs on each game-hosting node.
//!
//! In this mode, the daemon:
//! 1. Loads its configuration document (issued by the panel)
//! 2. Connects to the local container engine and verifies it answers
//! 3. Adopts containers for servers the panel already knows about
//! 4. Announces itself to the panel, which marks the node online
//! 5. Runs the health and metrics loops
//! 6. Serves the agent API the panel drives

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use gantry_agent::api::AgentApiState;
use gantry_agent::{
    AgentConfig, ConsoleBridge, ContainerRuntime, EngineClient, PanelClient, Supervisor,
};

/// Run the node agent.
pub async fn run_agent(config_path: PathBuf) -> anyhow::Result<()> {
    info!("Gantry agent starting");
    let config = AgentConfig::from_file(&config_path)
        .await
        .map_err(|e| anyhow::anyhow!("load config {}: {e}", config_path.display()))?;

    // ── Container engine ───────────────────────────────────────
    let engine = Arc::new(EngineClient::new(
        &config.engine_socket,
        Duration::from_secs(config.request_timeout_secs),
    ));
    engine
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("container engine unreachable: {e}"))?;
    info!(socket = %config.engine_socket, "container engine connected");

    let supervisor = Arc::new(Supervisor::new(
        engine,
        &config.data_dir,
        config.stop_timeout_secs,
    ));

    // ── Panel handshake ────────────────────────────────────────
    // Both are best-effort: the agent still serves its API when the panel
    // is down, and the panel retries through its liveness view.
    let panel = Arc::new(PanelClient::new(
        &config.panel_url,
        &config.node_id,
        &config.token,
        Duration::from_secs(config.request_timeout_secs),
    )?);

    match panel.fetch_configuration().await {
        Ok(doc) => info!(token_id = %doc["token_id"].as_str().unwrap_or(""), "configuration fetched"),
        Err(err) => warn!(%err, "could not fetch configuration from panel"),
    }
    match panel.fetch_servers().await {
        Ok(specs) => {
            if let Err(err) = supervisor.load_servers(&specs).await {
                warn!(%err, "server adoption failed");
            }
        }
        Err(err) => warn!(%err, "could not fetch server specs from panel"),
    }
    if let Err(err) = panel.announce(config.listen_port).await {
        warn!(%err, "panel announce failed, continuing");
    }

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background loops ───────────────────────────────────────
    let health_handle = tokio::spawn(gantry_agent::health::run(
        supervisor.clone(),
        Duration::from_secs(config.health_interval_secs),
        shutdown_rx.clone(),
    ));
    let metrics_handle = tokio::spawn(gantry_agent::metrics::run(
        supervisor.clone(),
        Duration::from_secs(config.metrics_interval_secs),
        shutdown_rx.clone(),
    ));

    // ── Agent API ──────────────────────────────────────────────
    let router = gantry_agent::api::build_router(AgentApiState {
        supervisor: supervisor.clone(),
        console: Arc::new(ConsoleBridge::new(supervisor)),
        panel: Some(panel),
        token: config.token.clone(),
        backup_root: PathBuf::from(&config.backup_dir),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    info!(%addr, "agent API starting");

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

    let _ = health_handle.await;
    let _ = metrics_handle.await;
    info!("Gantry agent stopped");
    Ok(())
}
