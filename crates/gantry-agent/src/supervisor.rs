//! Server supervision against the local container engine.
//!
//! The supervisor owns the node's registry of managed servers. Each entry
//! tracks the container id, the last observed status, and the latest stats
//! sample. All engine access goes through [`ContainerRuntime`] so the logic
//! here tests against an in-memory fake.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gantry_state::{epoch_secs, ServerSpec, ServerStats, ServerStatus, SystemInfo};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::runtime::{
    Bind, ContainerRuntime, ContainerSpec, ContainerState, PortBinding, RuntimeError,
};

/// Label marking containers as supervisor-managed.
pub const MANAGED_LABEL: &str = "gantry.managed";
/// Label carrying the owning server id.
pub const SERVER_ID_LABEL: &str = "gantry.server.id";

/// Working directory inside every server container.
pub const CONTAINER_WORKDIR: &str = "/home/container";

/// One supervised server.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub spec: ServerSpec,
    pub container_id: String,
    pub status: ServerStatus,
    /// Epoch seconds of the last successful start, for uptime.
    pub started_at: Option<u64>,
    pub stats: ServerStats,
}

/// Node-local server registry and engine driver.
pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
    data_dir: PathBuf,
    stop_timeout_secs: u32,
    servers: RwLock<HashMap<String, Arc<RwLock<ServerEntry>>>>,
}

/// Translate an engine state into a server status.
fn map_state(state: ContainerState) -> ServerStatus {
    match state {
        ContainerState::Running => ServerStatus::Running,
        ContainerState::Restarting => ServerStatus::Restarting,
        ContainerState::Created
        | ContainerState::Paused
        | ContainerState::Exited
        | ContainerState::Dead => ServerStatus::Stopped,
    }
}

/// Build the container spec for a server.
///
/// Every allocation is published on both tcp and udp since game protocols
/// routinely use both on the same port. The primary allocation is exported
/// to the server process through `SERVER_IP`/`SERVER_PORT`.
pub fn build_container_spec(
    spec: &ServerSpec,
    data_dir: &Path,
    stop_timeout_secs: u32,
) -> ContainerSpec {
    const MB: u64 = 1024 * 1024;

    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(SERVER_ID_LABEL.to_string(), spec.server_id.clone());

    let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    env.sort();
    env.push(format!("SERVER_MEMORY={}", spec.limits.memory_mb));
    if let Some(primary) = spec.allocations.iter().find(|a| a.is_primary) {
        env.push(format!("SERVER_IP={}", primary.ip));
        env.push(format!("SERVER_PORT={}", primary.port));
    }

    let mut binds = vec![Bind {
        host_path: data_dir
            .join(&spec.server_id)
            .to_string_lossy()
            .into_owned(),
        container_path: CONTAINER_WORKDIR.to_string(),
        read_only: false,
    }];
    for mount in &spec.mounts {
        binds.push(Bind {
            host_path: mount.source.clone(),
            container_path: mount.target.clone(),
            read_only: mount.read_only,
        });
    }

    let mut ports = Vec::with_capacity(spec.allocations.len() * 2);
    for alloc in &spec.allocations {
        for protocol in ["tcp", "udp"] {
            ports.push(PortBinding {
                host_ip: alloc.ip.clone(),
                host_port: alloc.port,
                container_port: alloc.port,
                protocol: protocol.to_string(),
            });
        }
    }

    ContainerSpec {
        name: format!("gantry-{}", spec.short_id),
        image: spec.image.clone(),
        cmd: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            spec.startup_cmd.clone(),
        ],
        env,
        working_dir: CONTAINER_WORKDIR.to_string(),
        labels,
        binds,
        ports,
        memory_bytes: spec.limits.memory_mb * MB,
        memory_swap_bytes: (spec.limits.memory_mb + spec.limits.swap_mb) * MB,
        cpu_quota: i64::from(spec.limits.cpu_pct) * 1000,
        cpu_period: 100_000,
        io_weight: spec.limits.io_weight,
        stop_timeout_secs,
    }
}

impl Supervisor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        data_dir: impl Into<PathBuf>,
        stop_timeout_secs: u32,
    ) -> Self {
        Self {
            runtime,
            data_dir: data_dir.into(),
            stop_timeout_secs,
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding a server's files on the host.
    pub fn server_data_dir(&self, server_id: &str) -> PathBuf {
        self.data_dir.join(server_id)
    }

    async fn entry(&self, server_id: &str) -> AgentResult<Arc<RwLock<ServerEntry>>> {
        self.servers
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(server_id.to_string()))
    }

    /// Ids of all supervised servers.
    pub async fn server_ids(&self) -> Vec<String> {
        self.servers.read().await.keys().cloned().collect()
    }

    pub async fn entry_snapshot(&self, server_id: &str) -> AgentResult<ServerEntry> {
        let entry = self.entry(server_id).await?;
        let snapshot = entry.read().await.clone();
        Ok(snapshot)
    }

    /// Create the container for a new server.
    ///
    /// Pulls the image only if the engine doesn't already have it. Returns
    /// the container id.
    pub async fn create_server(&self, spec: ServerSpec) -> AgentResult<String> {
        {
            let servers = self.servers.read().await;
            if servers.contains_key(&spec.server_id) {
                return Err(AgentError::Conflict(format!(
                    "server {} already supervised",
                    spec.server_id
                )));
            }
        }

        let server_dir = self.server_data_dir(&spec.server_id);
        tokio::fs::create_dir_all(&server_dir).await?;

        if !self.runtime.image_exists(&spec.image).await? {
            info!(image = %spec.image, "pulling image");
            self.runtime.pull_image(&spec.image).await?;
        }

        let container = build_container_spec(&spec, &self.data_dir, self.stop_timeout_secs);
        let container_id = self.runtime.create_container(&container).await?;
        info!(server_id = %spec.server_id, container_id = %container_id, "container created");

        let entry = ServerEntry {
            spec: spec.clone(),
            container_id: container_id.clone(),
            status: ServerStatus::Stopped,
            started_at: None,
            stats: ServerStats::default(),
        };
        self.servers
            .write()
            .await
            .insert(spec.server_id, Arc::new(RwLock::new(entry)));
        Ok(container_id)
    }

    pub async fn start_server(&self, server_id: &str) -> AgentResult<()> {
        let entry = self.entry(server_id).await?;
        let mut guard = entry.write().await;
        self.runtime.start_container(&guard.container_id).await?;
        guard.status = ServerStatus::Running;
        guard.started_at = Some(epoch_secs());
        info!(%server_id, "server started");
        Ok(())
    }

    pub async fn stop_server(&self, server_id: &str) -> AgentResult<()> {
        let entry = self.entry(server_id).await?;
        let mut guard = entry.write().await;
        self.runtime
            .stop_container(&guard.container_id, self.stop_timeout_secs)
            .await?;
        guard.status = ServerStatus::Stopped;
        guard.started_at = None;
        info!(%server_id, "server stopped");
        Ok(())
    }

    pub async fn kill_server(&self, server_id: &str) -> AgentResult<()> {
        let entry = self.entry(server_id).await?;
        let mut guard = entry.write().await;
        self.runtime.kill_container(&guard.container_id).await?;
        guard.status = ServerStatus::Stopped;
        guard.started_at = None;
        info!(%server_id, "server killed");
        Ok(())
    }

    pub async fn restart_server(&self, server_id: &str) -> AgentResult<()> {
        let entry = self.entry(server_id).await?;
        let mut guard = entry.write().await;
        self.runtime
            .restart_container(&guard.container_id, self.stop_timeout_secs)
            .await?;
        guard.status = ServerStatus::Running;
        guard.started_at = Some(epoch_secs());
        info!(%server_id, "server restarted");
        Ok(())
    }

    /// Run a command inside a running server's container.
    pub async fn send_command(&self, server_id: &str, command: &str) -> AgentResult<()> {
        let entry = self.entry(server_id).await?;
        let guard = entry.read().await;
        if guard.status != ServerStatus::Running {
            return Err(AgentError::Conflict(format!(
                "server {server_id} is not running"
            )));
        }
        let cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ];
        self.runtime.exec(&guard.container_id, &cmd).await?;
        Ok(())
    }

    /// Tear down a server's container and data.
    ///
    /// The registry entry is always evicted, even when the engine or the
    /// filesystem cleanup fails, so a retried delete converges.
    pub async fn delete_server(&self, server_id: &str) -> AgentResult<()> {
        let entry = self.entry(server_id).await?;
        let container_id = entry.read().await.container_id.clone();

        if let Err(err) = self.runtime.remove_container(&container_id, true).await {
            warn!(%server_id, %err, "container removal failed, evicting anyway");
        }
        let server_dir = self.server_data_dir(server_id);
        if let Err(err) = tokio::fs::remove_dir_all(&server_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(%server_id, %err, "data directory removal failed");
            }
        }

        self.servers.write().await.remove(server_id);
        info!(%server_id, "server deleted");
        Ok(())
    }

    /// Replace a server's container with a fresh one from its spec.
    ///
    /// Server files under the data directory are kept.
    pub async fn reinstall_server(&self, spec: ServerSpec) -> AgentResult<String> {
        let entry = self.entry(&spec.server_id).await?;
        let mut guard = entry.write().await;

        if let Err(err) = self.runtime.remove_container(&guard.container_id, true).await {
            warn!(server_id = %spec.server_id, %err, "old container removal failed");
        }

        if !self.runtime.image_exists(&spec.image).await? {
            self.runtime.pull_image(&spec.image).await?;
        }
        let container = build_container_spec(&spec, &self.data_dir, self.stop_timeout_secs);
        let container_id = self.runtime.create_container(&container).await?;
        info!(server_id = %spec.server_id, container_id = %container_id, "server reinstalled");

        guard.spec = spec;
        guard.container_id = container_id.clone();
        guard.status = ServerStatus::Stopped;
        guard.started_at = None;
        guard.stats = ServerStats::default();
        Ok(container_id)
    }

    /// Adopt containers for known servers after a restart.
    ///
    /// Matches engine containers by the server-id label against the specs
    /// the panel hands over, and seeds each entry from the engine's current
    /// state. Specs without a matching container are skipped; the panel
    /// reconciles those through its health view.
    pub async fn load_servers(&self, specs: &[ServerSpec]) -> AgentResult<usize> {
        let listed = self.runtime.list_by_label(MANAGED_LABEL, "true").await?;
        let by_server: HashMap<&str, &str> = listed
            .iter()
            .filter_map(|(id, labels)| {
                labels
                    .get(SERVER_ID_LABEL)
                    .map(|sid| (sid.as_str(), id.as_str()))
            })
            .collect();

        let mut adopted = 0;
        let mut servers = self.servers.write().await;
        for spec in specs {
            let Some(container_id) = by_server.get(spec.server_id.as_str()) else {
                warn!(server_id = %spec.server_id, "no container found for known server");
                continue;
            };
            let status = match self.runtime.container_state(container_id).await {
                Ok(state) => map_state(state),
                Err(err) => {
                    warn!(server_id = %spec.server_id, %err, "state probe failed during adoption");
                    ServerStatus::Stopped
                }
            };
            let started_at = (status == ServerStatus::Running).then(epoch_secs);
            servers.insert(
                spec.server_id.clone(),
                Arc::new(RwLock::new(ServerEntry {
                    spec: spec.clone(),
                    container_id: container_id.to_string(),
                    status,
                    started_at,
                    stats: ServerStats::default(),
                })),
            );
            adopted += 1;
        }
        info!(adopted, total = specs.len(), "servers adopted from engine");
        Ok(adopted)
    }

    /// Re-read one server's engine state into its entry. Touches only the
    /// status field.
    pub async fn refresh_state(&self, server_id: &str) -> AgentResult<ServerStatus> {
        let entry = self.entry(server_id).await?;
        let container_id = entry.read().await.container_id.clone();
        let status = match self.runtime.container_state(&container_id).await {
            Ok(state) => map_state(state),
            Err(RuntimeError::NotFound(_)) => ServerStatus::Error,
            Err(err) => return Err(err.into()),
        };

        let mut guard = entry.write().await;
        if guard.status != status {
            debug!(%server_id, from = ?guard.status, to = ?status, "observed status change");
            if status != ServerStatus::Running {
                guard.started_at = None;
            }
        }
        guard.status = status;
        Ok(status)
    }

    /// Scrape one server's usage sample into its entry. Touches only the
    /// stats field.
    pub async fn refresh_stats(&self, server_id: &str) -> AgentResult<ServerStats> {
        let entry = self.entry(server_id).await?;
        let (container_id, started_at) = {
            let guard = entry.read().await;
            (guard.container_id.clone(), guard.started_at)
        };
        let raw = self.runtime.container_stats(&container_id).await?;

        let mut guard = entry.write().await;
        let stats = ServerStats {
            state: format!("{:?}", guard.status).to_lowercase(),
            cpu_percent: raw.cpu_percent,
            memory_used_bytes: raw.memory_used_bytes,
            memory_limit_bytes: raw.memory_limit_bytes,
            network_rx_bytes: raw.network_rx_bytes,
            network_tx_bytes: raw.network_tx_bytes,
            uptime_secs: started_at.map(|t| epoch_secs().saturating_sub(t)).unwrap_or(0),
        };
        guard.stats = stats.clone();
        Ok(stats)
    }

    pub async fn server_stats(&self, server_id: &str) -> AgentResult<ServerStats> {
        let entry = self.entry(server_id).await?;
        let guard = entry.read().await;
        Ok(guard.stats.clone())
    }

    /// Node facts for registration and the system endpoint.
    pub async fn system_info(&self) -> AgentResult<SystemInfo> {
        let info = self.runtime.info().await?;
        Ok(SystemInfo {
            version: info.version,
            kernel: info.kernel,
            os: info.os,
            cpu_cores: info.cpu_cores,
            memory_mb: info.memory_mb,
        })
    }
}
