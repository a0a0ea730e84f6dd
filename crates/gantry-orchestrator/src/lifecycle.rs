//! Server lifecycle state machine.
//!
//! Status is written optimistically before each remote call: a server moves
//! to `Starting` before the node is asked to start it, so a concurrent
//! operation observes the transition in flight. Remote failures park the
//! server in `Error`; `kill` is the unconditional correction path and always
//! ends in `Stopped`.
//!
//! Delete is a compensating sequence, not a transaction: kill remotely
//! (failures logged, never blocking), release the reserved capacity
//! (idempotent), drop backup rows, drop the server row. Local state wins
//! over an unreachable node.

use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use gantry_placement::PlacementEngine;
use gantry_state::{
    Backup, BackupStatus, PortAllocation, ResourceLimits, Server, ServerId, ServerSpec,
    ServerStats, ServerStatus, StateStore, epoch_secs,
};

use crate::error::{LifecycleError, LifecycleResult};
use crate::transport::NodeTransport;

/// Default number of retained backups when a request does not say.
const DEFAULT_BACKUP_LIMIT: u32 = 2;

/// Default block IO weight for server containers.
const DEFAULT_IO_WEIGHT: u16 = 500;

/// Request payload for creating a server.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub owner_id: String,
    pub node_id: String,
    pub image: String,
    pub startup_cmd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub limits: ResourceLimits,
    #[serde(default)]
    pub backup_limit: Option<u32>,
}

/// Drives servers through their lifecycle.
///
/// Each lifecycle operation takes the server's own mutex for its full
/// duration, including the remote call, so operations on one server
/// serialize while different servers proceed in parallel.
pub struct Orchestrator {
    state: StateStore,
    placement: PlacementEngine,
    transport: Arc<dyn NodeTransport>,
    locks: Mutex<HashMap<ServerId, Arc<Mutex<()>>>>,
}

/// Random 128-bit identifier rendered as 32 hex chars.
fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Orchestrator {
    pub fn new(
        state: StateStore,
        placement: PlacementEngine,
        transport: Arc<dyn NodeTransport>,
    ) -> Self {
        Self {
            state,
            placement,
            transport,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (or create) the mutex guarding one server's lifecycle.
    async fn server_lock(&self, server_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn must_server(&self, server_id: &str) -> LifecycleResult<Server> {
        self.state
            .get_server(server_id)?
            .ok_or_else(|| LifecycleError::NotFound(format!("server {server_id}")))
    }

    fn must_node(&self, node_id: &str) -> LifecycleResult<gantry_state::Node> {
        self.state
            .get_node(node_id)?
            .ok_or_else(|| LifecycleError::NotFound(format!("node {node_id}")))
    }

    /// Build the spec the agent needs to materialize this server.
    fn build_spec(&self, server: &Server) -> LifecycleResult<ServerSpec> {
        let allocations: Vec<PortAllocation> = self
            .state
            .list_allocations_for_node(&server.node_id)?
            .into_iter()
            .filter(|a| a.server_id.as_deref() == Some(server.id.as_str()))
            .map(|a| PortAllocation {
                ip: a.ip,
                port: a.port,
                is_primary: a.is_primary,
            })
            .collect();

        Ok(ServerSpec {
            server_id: server.id.clone(),
            short_id: server.short_id.clone(),
            image: server.image.clone(),
            startup_cmd: server.startup_cmd.clone(),
            env: server.env.clone(),
            limits: server.limits.clone(),
            allocations,
            mounts: Vec::new(),
        })
    }

    // ── Create / install ───────────────────────────────────────────

    /// Create a server: reserve capacity, persist the record, and ask the
    /// node to materialize the container.
    ///
    /// A remote failure leaves the server parked in `Error` with its
    /// reservation intact, recoverable via [`reinstall_server`](Self::reinstall_server)
    /// or [`delete_server`](Self::delete_server).
    pub async fn create_server(&self, req: CreateServerRequest) -> LifecycleResult<Server> {
        if req.name.trim().is_empty() {
            return Err(LifecycleError::Validation("server name is required".into()));
        }
        if req.image.trim().is_empty() {
            return Err(LifecycleError::Validation("image is required".into()));
        }
        if req.limits.memory_mb == 0 || req.limits.disk_mb == 0 || req.limits.cpu_pct == 0 {
            return Err(LifecycleError::Validation(
                "memory, disk, and cpu limits must be positive".into(),
            ));
        }

        let id = generate_id();
        let short_id: String = id.chars().take(8).collect();

        let mut limits = req.limits.clone();
        if limits.swap_mb == 0 {
            limits.swap_mb = limits.memory_mb * 2;
        }
        if limits.io_weight == 0 {
            limits.io_weight = DEFAULT_IO_WEIGHT;
        }

        let allocation = self.placement.reserve(&req.node_id, &id, &limits)?;
        let allocation_key = allocation.table_key();

        let now = epoch_secs();
        let mut server = Server {
            id: id.clone(),
            short_id,
            name: req.name,
            description: req.description,
            owner_id: req.owner_id,
            node_id: req.node_id.clone(),
            allocation_key: allocation_key.clone(),
            status: ServerStatus::Installing,
            suspended: false,
            suspended_reason: None,
            image: req.image,
            startup_cmd: req.startup_cmd,
            env: req.env,
            limits: limits.clone(),
            backup_limit: req.backup_limit.unwrap_or(DEFAULT_BACKUP_LIMIT),
            container_id: None,
            installed_at: None,
            last_started_at: None,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.state.put_server(&server) {
            // Undo the reservation so a failed persist leaks nothing.
            if let Err(release_err) = self.placement.release(&allocation_key, &limits) {
                warn!(server_id = %id, error = %release_err, "reservation rollback failed");
            }
            return Err(e.into());
        }

        let node = self.must_node(&req.node_id)?;
        let spec = self.build_spec(&server)?;
        match self.transport.create_server(&node, &spec).await {
            Ok(container_id) => {
                server.container_id = Some(container_id);
                server.updated_at = epoch_secs();
                self.state.put_server(&server)?;
                info!(server_id = %id, node_id = %req.node_id, port = allocation.port, "server created");
                Ok(server)
            }
            Err(e) => {
                server.status = ServerStatus::Error;
                server.updated_at = epoch_secs();
                if let Err(persist_err) = self.state.put_server(&server) {
                    warn!(server_id = %id, error = %persist_err, "failed to persist error status");
                }
                Err(LifecycleError::RemoteFailure(e.to_string()))
            }
        }
    }

    /// Install-completion signal from the node: `Installing` → `Stopped`.
    /// A repeated signal is a no-op.
    pub async fn mark_installed(&self, server_id: &str) -> LifecycleResult<Server> {
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;

        let mut server = self.must_server(server_id)?;
        if server.status == ServerStatus::Installing {
            server.status = ServerStatus::Stopped;
            server.installed_at = Some(epoch_secs());
            server.updated_at = epoch_secs();
            self.state.put_server(&server)?;
            info!(%server_id, "server installed");
        }
        Ok(server)
    }

    // ── Power ──────────────────────────────────────────────────────

    pub async fn start_server(&self, server_id: &str) -> LifecycleResult<Server> {
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;

        let mut server = self.must_server(server_id)?;
        if server.suspended {
            return Err(LifecycleError::Conflict(format!(
                "server {server_id} is suspended"
            )));
        }
        match server.status {
            ServerStatus::Stopped => {}
            ServerStatus::Running | ServerStatus::Starting | ServerStatus::Restarting => {
                return Err(LifecycleError::Conflict(format!(
                    "server {server_id} is already running or starting"
                )));
            }
            ServerStatus::Stopping => {
                return Err(LifecycleError::Conflict(format!(
                    "server {server_id} is stopping"
                )));
            }
            ServerStatus::Installing => {
                return Err(LifecycleError::Conflict(format!(
                    "server {server_id} is still installing"
                )));
            }
            ServerStatus::Error => {
                return Err(LifecycleError::Conflict(format!(
                    "server {server_id} is in error state; kill or reinstall first"
                )));
            }
            ServerStatus::Suspended => {
                return Err(LifecycleError::Conflict(format!(
                    "server {server_id} is suspended"
                )));
            }
        }

        server.status = ServerStatus::Starting;
        server.updated_at = epoch_secs();
        self.state.put_server(&server)?;

        let node = self.must_node(&server.node_id)?;
        match self.transport.start_server(&node, server_id).await {
            Ok(()) => {
                server.status = ServerStatus::Running;
                server.last_started_at = Some(epoch_secs());
                server.updated_at = epoch_secs();
                self.state.put_server(&server)?;
                info!(%server_id, "server started");
                Ok(server)
            }
            Err(e) => {
                server.status = ServerStatus::Error;
                server.updated_at = epoch_secs();
                self.state.put_server(&server)?;
                Err(LifecycleError::RemoteFailure(e.to_string()))
            }
        }
    }

    pub async fn stop_server(&self, server_id: &str) -> LifecycleResult<Server> {
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;

        let mut server = self.must_server(server_id)?;
        if !server.status.is_active() {
            return Err(LifecycleError::Conflict(format!(
                "server {server_id} is not running"
            )));
        }

        server.status = ServerStatus::Stopping;
        server.updated_at = epoch_secs();
        self.state.put_server(&server)?;

        let node = self.must_node(&server.node_id)?;
        match self.transport.stop_server(&node, server_id).await {
            Ok(()) => {
                server.status = ServerStatus::Stopped;
                server.updated_at = epoch_secs();
                self.state.put_server(&server)?;
                info!(%server_id, "server stopped");
                Ok(server)
            }
            Err(e) => {
                server.status = ServerStatus::Error;
                server.updated_at = epoch_secs();
                self.state.put_server(&server)?;
                Err(LifecycleError::RemoteFailure(e.to_string()))
            }
        }
    }

    pub async fn restart_server(&self, server_id: &str) -> LifecycleResult<Server> {
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;

        let mut server = self.must_server(server_id)?;
        if server.suspended {
            return Err(LifecycleError::Conflict(format!(
                "server {server_id} is suspended"
            )));
        }
        match server.status {
            ServerStatus::Running | ServerStatus::Stopped | ServerStatus::Starting => {}
            _ => {
                return Err(LifecycleError::Conflict(format!(
                    "server {server_id} cannot restart from {:?}",
                    server.status
                )));
            }
        }

        server.status = ServerStatus::Restarting;
        server.updated_at = epoch_secs();
        self.state.put_server(&server)?;

        let node = self.must_node(&server.node_id)?;
        match self.transport.restart_server(&node, server_id).await {
            Ok(()) => {
                server.status = ServerStatus::Running;
                server.last_started_at = Some(epoch_secs());
                server.updated_at = epoch_secs();
                self.state.put_server(&server)?;
                info!(%server_id, "server restarted");
                Ok(server)
            }
            Err(e) => {
                server.status = ServerStatus::Error;
                server.updated_at = epoch_secs();
                self.state.put_server(&server)?;
                Err(LifecycleError::RemoteFailure(e.to_string()))
            }
        }
    }

    /// Forcibly terminate the container. Always succeeds locally: a remote
    /// failure is logged and the server still ends `Stopped`, making kill
    /// the escape hatch from `Error`.
    pub async fn kill_server(&self, server_id: &str) -> LifecycleResult<Server> {
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;

        let mut server = self.must_server(server_id)?;
        match self.state.get_node(&server.node_id)? {
            Some(node) => {
                if let Err(e) = self.transport.kill_server(&node, server_id).await {
                    warn!(%server_id, error = %e, "remote kill failed, forcing stopped state");
                }
            }
            None => warn!(%server_id, "node missing during kill, forcing stopped state"),
        }

        server.status = ServerStatus::Stopped;
        server.updated_at = epoch_secs();
        self.state.put_server(&server)?;
        info!(%server_id, "server killed");
        Ok(server)
    }

    /// Send a console command to a running server. No state change.
    pub async fn send_command(&self, server_id: &str, command: &str) -> LifecycleResult<()> {
        let server = self.must_server(server_id)?;
        if server.status != ServerStatus::Running {
            return Err(LifecycleError::Conflict(format!(
                "server {server_id} is not running"
            )));
        }
        let node = self.must_node(&server.node_id)?;
        self.transport
            .send_command(&node, server_id, command)
            .await
            .map_err(|e| LifecycleError::RemoteFailure(e.to_string()))
    }

    // ── Suspension ─────────────────────────────────────────────────

    /// Suspend a server, force-stopping it first if it is live. Remote stop
    /// failures are logged; suspension applies regardless.
    pub async fn suspend_server(
        &self,
        server_id: &str,
        reason: Option<String>,
    ) -> LifecycleResult<Server> {
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;

        let mut server = self.must_server(server_id)?;
        if server.status.is_active() {
            match self.state.get_node(&server.node_id)? {
                Some(node) => {
                    if let Err(e) = self.transport.stop_server(&node, server_id).await {
                        warn!(%server_id, error = %e, "stop during suspend failed, continuing");
                    }
                }
                None => warn!(%server_id, "node missing during suspend"),
            }
        }

        server.suspended = true;
        server.suspended_reason = reason;
        server.status = ServerStatus::Suspended;
        server.updated_at = epoch_secs();
        self.state.put_server(&server)?;
        info!(%server_id, "server suspended");
        Ok(server)
    }

    pub async fn unsuspend_server(&self, server_id: &str) -> LifecycleResult<Server> {
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;

        let mut server = self.must_server(server_id)?;
        if !server.suspended {
            return Err(LifecycleError::Conflict(format!(
                "server {server_id} is not suspended"
            )));
        }

        server.suspended = false;
        server.suspended_reason = None;
        server.status = ServerStatus::Stopped;
        server.updated_at = epoch_secs();
        self.state.put_server(&server)?;
        info!(%server_id, "server unsuspended");
        Ok(server)
    }

    // ── Backups ────────────────────────────────────────────────────

    /// Trigger a backup on the node. The row starts `Pending`; the node
    /// reports completion or failure through the callbacks below. A backup
    /// that fails is never retried automatically.
    pub async fn create_backup(&self, server_id: &str, name: &str) -> LifecycleResult<Backup> {
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;

        let server = self.must_server(server_id)?;
        let count = self.state.count_backups_for_server(server_id)?;
        if count >= server.backup_limit {
            return Err(LifecycleError::Conflict(format!(
                "server {server_id} is at its backup limit of {}",
                server.backup_limit
            )));
        }

        let mut backup = Backup {
            id: generate_id(),
            server_id: server_id.to_string(),
            name: name.to_string(),
            status: BackupStatus::Pending,
            checksum: None,
            size_bytes: 0,
            is_locked: false,
            error: None,
            completed_at: None,
            created_at: epoch_secs(),
        };
        self.state.put_backup(&backup)?;

        let node = self.must_node(&server.node_id)?;
        match self
            .transport
            .create_backup(&node, server_id, &backup.id, name)
            .await
        {
            Ok(()) => {
                info!(%server_id, backup_id = %backup.id, "backup requested");
                Ok(backup)
            }
            Err(e) => {
                backup.status = BackupStatus::Failed;
                backup.error = Some(e.to_string());
                self.state.put_backup(&backup)?;
                Err(LifecycleError::RemoteFailure(e.to_string()))
            }
        }
    }

    /// Completion callback from the node.
    pub fn backup_completed(
        &self,
        server_id: &str,
        backup_id: &str,
        checksum: &str,
        size_bytes: u64,
    ) -> LifecycleResult<Backup> {
        let mut backup = self
            .state
            .get_backup(server_id, backup_id)?
            .ok_or_else(|| LifecycleError::NotFound(format!("backup {backup_id}")))?;

        backup.status = BackupStatus::Completed;
        backup.checksum = Some(checksum.to_string());
        backup.size_bytes = size_bytes;
        backup.completed_at = Some(epoch_secs());
        self.state.put_backup(&backup)?;
        info!(%server_id, %backup_id, size_bytes, "backup completed");
        Ok(backup)
    }

    /// Failure callback from the node.
    pub fn backup_failed(
        &self,
        server_id: &str,
        backup_id: &str,
        error: &str,
    ) -> LifecycleResult<Backup> {
        let mut backup = self
            .state
            .get_backup(server_id, backup_id)?
            .ok_or_else(|| LifecycleError::NotFound(format!("backup {backup_id}")))?;

        backup.status = BackupStatus::Failed;
        backup.error = Some(error.to_string());
        self.state.put_backup(&backup)?;
        warn!(%server_id, %backup_id, %error, "backup failed");
        Ok(backup)
    }

    pub fn list_backups(&self, server_id: &str) -> LifecycleResult<Vec<Backup>> {
        self.must_server(server_id)?;
        Ok(self.state.list_backups_for_server(server_id)?)
    }

    // ── Reinstall ──────────────────────────────────────────────────

    /// Tear down and re-create the server's container from its spec.
    pub async fn reinstall_server(&self, server_id: &str) -> LifecycleResult<Server> {
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;

        let mut server = self.must_server(server_id)?;
        if server.suspended {
            return Err(LifecycleError::Conflict(format!(
                "server {server_id} is suspended"
            )));
        }

        let node = self.must_node(&server.node_id)?;
        if server.status.is_active() {
            if let Err(e) = self.transport.kill_server(&node, server_id).await {
                warn!(%server_id, error = %e, "kill before reinstall failed, continuing");
            }
        }

        server.status = ServerStatus::Installing;
        server.installed_at = None;
        server.updated_at = epoch_secs();
        self.state.put_server(&server)?;

        let spec = self.build_spec(&server)?;
        match self.transport.reinstall_server(&node, &spec).await {
            Ok(()) => {
                info!(%server_id, "server reinstall requested");
                Ok(server)
            }
            Err(e) => {
                server.status = ServerStatus::Error;
                server.updated_at = epoch_secs();
                self.state.put_server(&server)?;
                Err(LifecycleError::RemoteFailure(e.to_string()))
            }
        }
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Delete a server and everything it owns. Remote teardown failures are
    /// logged and never block; the capacity release is idempotent, so the
    /// node's counters are decremented exactly once even across retries.
    pub async fn delete_server(&self, server_id: &str) -> LifecycleResult<()> {
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;

        let server = self.must_server(server_id)?;

        match self.state.get_node(&server.node_id)? {
            Some(node) => {
                if let Err(e) = self.transport.kill_server(&node, server_id).await {
                    warn!(%server_id, error = %e, "kill during delete failed, continuing");
                }
                if let Err(e) = self.transport.delete_server(&node, server_id).await {
                    warn!(%server_id, error = %e, "remote delete failed, continuing");
                }
            }
            None => warn!(%server_id, "node missing during delete, skipping remote teardown"),
        }

        let released = self
            .placement
            .release(&server.allocation_key, &server.limits)?;
        if !released {
            warn!(%server_id, allocation_key = %server.allocation_key, "allocation was already released");
        }

        let backups = self.state.delete_backups_for_server(server_id)?;
        self.state.delete_server(server_id)?;
        self.locks.lock().await.remove(server_id);

        info!(%server_id, backups_removed = backups, "server deleted");
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_server(&self, server_id: &str) -> LifecycleResult<Server> {
        self.must_server(server_id)
    }

    pub fn list_servers(&self) -> LifecycleResult<Vec<Server>> {
        Ok(self.state.list_servers()?)
    }

    /// Specs for every server on a node, as its agent needs them to adopt
    /// running containers after a restart.
    pub fn server_specs_for_node(&self, node_id: &str) -> LifecycleResult<Vec<ServerSpec>> {
        self.must_node(node_id)?;
        self.state
            .list_servers_for_node(node_id)?
            .iter()
            .map(|server| self.build_spec(server))
            .collect()
    }

    /// Live resource usage, fetched from the server's node.
    pub async fn server_stats(&self, server_id: &str) -> LifecycleResult<ServerStats> {
        let server = self.must_server(server_id)?;
        let node = self.must_node(&server.node_id)?;
        self.transport
            .fetch_stats(&node, server_id)
            .await
            .map_err(|e| LifecycleError::RemoteFailure(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use gantry_state::{Allocation, Node};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    /// Records every remote call and fails the ops it is told to.
    #[derive(Default)]
    struct MockTransport {
        calls: StdMutex<Vec<String>>,
        failing: StdMutex<HashSet<String>>,
    }

    impl MockTransport {
        fn fail_on(&self, op: &str) {
            self.failing.lock().unwrap().insert(op.to_string());
        }

        fn count(&self, op: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.as_str() == op)
                .count()
        }

        fn record(&self, op: &str) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push(op.to_string());
            if self.failing.lock().unwrap().contains(op) {
                Err(TransportError::Request(format!("injected {op} failure")))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl NodeTransport for MockTransport {
        async fn create_server(
            &self,
            _node: &Node,
            _spec: &ServerSpec,
        ) -> Result<String, TransportError> {
            self.record("create")?;
            Ok("container-1".to_string())
        }

        async fn start_server(&self, _n: &Node, _id: &str) -> Result<(), TransportError> {
            self.record("start")
        }

        async fn stop_server(&self, _n: &Node, _id: &str) -> Result<(), TransportError> {
            self.record("stop")
        }

        async fn restart_server(&self, _n: &Node, _id: &str) -> Result<(), TransportError> {
            self.record("restart")
        }

        async fn kill_server(&self, _n: &Node, _id: &str) -> Result<(), TransportError> {
            self.record("kill")
        }

        async fn send_command(
            &self,
            _n: &Node,
            _id: &str,
            _cmd: &str,
        ) -> Result<(), TransportError> {
            self.record("command")
        }

        async fn create_backup(
            &self,
            _n: &Node,
            _id: &str,
            _backup_id: &str,
            _name: &str,
        ) -> Result<(), TransportError> {
            self.record("backup")
        }

        async fn reinstall_server(
            &self,
            _n: &Node,
            _spec: &ServerSpec,
        ) -> Result<(), TransportError> {
            self.record("reinstall")
        }

        async fn delete_server(&self, _n: &Node, _id: &str) -> Result<(), TransportError> {
            self.record("delete")
        }

        async fn fetch_stats(
            &self,
            _n: &Node,
            _id: &str,
        ) -> Result<ServerStats, TransportError> {
            self.record("stats")?;
            Ok(ServerStats::default())
        }
    }

    fn test_node(memory_mb: u64) -> Node {
        Node {
            id: "node-1".to_string(),
            name: "node-1".to_string(),
            description: String::new(),
            location_id: "loc-1".to_string(),
            fqdn: "node-1.example.com".to_string(),
            scheme: "http".to_string(),
            daemon_port: 8080,
            sftp_port: 2022,
            daemon_token: "t".repeat(64),
            memory_total_mb: memory_mb,
            memory_allocated_mb: 0,
            memory_overalloc_pct: 0,
            disk_total_mb: 102400,
            disk_allocated_mb: 0,
            disk_overalloc_pct: 0,
            cpu_total_pct: 800,
            cpu_allocated_pct: 0,
            is_online: true,
            maintenance_mode: false,
            last_checked_at: 1000,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_request(memory_mb: u64) -> CreateServerRequest {
        CreateServerRequest {
            name: "survival".to_string(),
            description: String::new(),
            owner_id: "owner-1".to_string(),
            node_id: "node-1".to_string(),
            image: "ghcr.io/example/minecraft:java17".to_string(),
            startup_cmd: "java -Xmx{MEMORY}M -jar server.jar".to_string(),
            env: HashMap::new(),
            limits: ResourceLimits {
                memory_mb,
                swap_mb: 0,
                disk_mb: 1024,
                cpu_pct: 100,
                io_weight: 0,
            },
            backup_limit: Some(2),
        }
    }

    fn setup(memory_mb: u64, ports: &[u16]) -> (Orchestrator, Arc<MockTransport>, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node(memory_mb)).unwrap();
        for &port in ports {
            store
                .put_allocation(&Allocation {
                    id: format!("alloc-{port}"),
                    node_id: "node-1".to_string(),
                    ip: "10.0.0.1".to_string(),
                    port,
                    alias: String::new(),
                    server_id: None,
                    is_primary: false,
                    created_at: 1000,
                })
                .unwrap();
        }
        let transport = Arc::new(MockTransport::default());
        let orch = Orchestrator::new(
            store.clone(),
            PlacementEngine::new(store.clone()),
            transport.clone(),
        );
        (orch, transport, store)
    }

    /// Create a server and walk it to Stopped via the install callback.
    async fn installed_server(orch: &Orchestrator, memory_mb: u64) -> Server {
        let server = orch.create_server(test_request(memory_mb)).await.unwrap();
        orch.mark_installed(&server.id).await.unwrap()
    }

    // ── Create / install ───────────────────────────────────────────

    #[tokio::test]
    async fn create_reserves_capacity_and_installs() {
        let (orch, transport, store) = setup(4096, &[25565, 25566]);

        let server = orch.create_server(test_request(2048)).await.unwrap();
        assert_eq!(server.status, ServerStatus::Installing);
        assert_eq!(server.container_id.as_deref(), Some("container-1"));
        assert_eq!(server.limits.swap_mb, 4096); // defaulted to 2x memory
        assert_eq!(server.limits.io_weight, 500);
        assert_eq!(transport.count("create"), 1);

        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 2048);

        // The lowest-port allocation is bound to the new server.
        let allocs = store.list_allocations_for_node("node-1").unwrap();
        assert_eq!(allocs[0].server_id.as_deref(), Some(server.id.as_str()));
        assert!(allocs[0].is_primary);
    }

    #[tokio::test]
    async fn create_beyond_capacity_is_exhausted_and_leaves_nothing() {
        let (orch, transport, store) = setup(4096, &[25565, 25566]);

        orch.create_server(test_request(2048)).await.unwrap();
        let err = orch.create_server(test_request(2049)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ResourceExhausted(_)));

        // No second server row, no counter movement, no remote call.
        assert_eq!(store.list_servers().unwrap().len(), 1);
        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 2048);
        assert_eq!(transport.count("create"), 1);
    }

    #[tokio::test]
    async fn create_remote_failure_parks_server_in_error() {
        let (orch, transport, store) = setup(4096, &[25565]);
        transport.fail_on("create");

        let err = orch.create_server(test_request(1024)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::RemoteFailure(_)));

        // The row survives in Error with its reservation intact, so the
        // operator can reinstall or delete.
        let servers = store.list_servers().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].status, ServerStatus::Error);
        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 1024);
    }

    #[tokio::test]
    async fn create_validates_limits() {
        let (orch, _, _) = setup(4096, &[25565]);
        let mut req = test_request(0);
        req.limits.memory_mb = 0;
        assert!(matches!(
            orch.create_server(req).await.unwrap_err(),
            LifecycleError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn mark_installed_is_idempotent() {
        let (orch, _, _) = setup(4096, &[25565]);
        let server = orch.create_server(test_request(1024)).await.unwrap();

        let installed = orch.mark_installed(&server.id).await.unwrap();
        assert_eq!(installed.status, ServerStatus::Stopped);
        assert!(installed.installed_at.is_some());

        // Repeated signal changes nothing.
        let again = orch.mark_installed(&server.id).await.unwrap();
        assert_eq!(again.status, ServerStatus::Stopped);
        assert_eq!(again.installed_at, installed.installed_at);
    }

    // ── Power ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn start_from_stopped_runs() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;

        let started = orch.start_server(&server.id).await.unwrap();
        assert_eq!(started.status, ServerStatus::Running);
        assert!(started.last_started_at.is_some());
        assert_eq!(transport.count("start"), 1);
    }

    #[tokio::test]
    async fn start_on_running_conflicts_without_remote_call() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        orch.start_server(&server.id).await.unwrap();

        let err = orch.start_server(&server.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)));
        // The rejected start never reached the node.
        assert_eq!(transport.count("start"), 1);
    }

    #[tokio::test]
    async fn concurrent_starts_exactly_one_wins() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        let orch = Arc::new(orch);

        let (a, b) = tokio::join!(
            orch.start_server(&server.id),
            orch.start_server(&server.id)
        );
        let oks = [a.is_ok(), b.is_ok()].iter().filter(|&&ok| ok).count();
        assert_eq!(oks, 1);
        let conflict = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
        assert!(matches!(conflict, LifecycleError::Conflict(_)));
        assert_eq!(transport.count("start"), 1);
    }

    #[tokio::test]
    async fn start_remote_failure_parks_in_error() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        transport.fail_on("start");

        let err = orch.start_server(&server.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::RemoteFailure(_)));
        assert_eq!(
            orch.get_server(&server.id).unwrap().status,
            ServerStatus::Error
        );
    }

    #[tokio::test]
    async fn stop_on_stopped_conflicts_without_remote_call() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;

        let err = orch.stop_server(&server.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)));
        assert_eq!(transport.count("stop"), 0);
    }

    #[tokio::test]
    async fn stop_running_server() {
        let (orch, _, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        orch.start_server(&server.id).await.unwrap();

        let stopped = orch.stop_server(&server.id).await.unwrap();
        assert_eq!(stopped.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn restart_returns_to_running() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        orch.start_server(&server.id).await.unwrap();

        let restarted = orch.restart_server(&server.id).await.unwrap();
        assert_eq!(restarted.status, ServerStatus::Running);
        assert_eq!(transport.count("restart"), 1);
    }

    #[tokio::test]
    async fn kill_always_ends_stopped_even_when_remote_fails() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        orch.start_server(&server.id).await.unwrap();
        transport.fail_on("kill");

        let killed = orch.kill_server(&server.id).await.unwrap();
        assert_eq!(killed.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn kill_recovers_from_error_state() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        transport.fail_on("start");
        orch.start_server(&server.id).await.unwrap_err();
        assert_eq!(
            orch.get_server(&server.id).unwrap().status,
            ServerStatus::Error
        );

        let killed = orch.kill_server(&server.id).await.unwrap();
        assert_eq!(killed.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn command_requires_running() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;

        let err = orch.send_command(&server.id, "say hi").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)));
        assert_eq!(transport.count("command"), 0);

        orch.start_server(&server.id).await.unwrap();
        orch.send_command(&server.id, "say hi").await.unwrap();
        assert_eq!(transport.count("command"), 1);
    }

    // ── Suspension ─────────────────────────────────────────────────

    #[tokio::test]
    async fn suspend_stops_and_blocks_start() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        orch.start_server(&server.id).await.unwrap();

        let suspended = orch
            .suspend_server(&server.id, Some("payment overdue".to_string()))
            .await
            .unwrap();
        assert_eq!(suspended.status, ServerStatus::Suspended);
        assert_eq!(
            suspended.suspended_reason.as_deref(),
            Some("payment overdue")
        );
        assert_eq!(transport.count("stop"), 1);

        let err = orch.start_server(&server.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)));

        let resumed = orch.unsuspend_server(&server.id).await.unwrap();
        assert_eq!(resumed.status, ServerStatus::Stopped);
        orch.start_server(&server.id).await.unwrap();
    }

    // ── Backups ────────────────────────────────────────────────────

    #[tokio::test]
    async fn backup_limit_rejects_with_zero_new_rows() {
        let (orch, transport, store) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;

        orch.create_backup(&server.id, "b1").await.unwrap();
        orch.create_backup(&server.id, "b2").await.unwrap();

        // Limit is 2: the third request must not create anything.
        let err = orch.create_backup(&server.id, "b3").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)));
        assert_eq!(store.list_backups_for_server(&server.id).unwrap().len(), 2);
        assert_eq!(transport.count("backup"), 2);
    }

    #[tokio::test]
    async fn backup_remote_failure_marks_row_failed() {
        let (orch, transport, store) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        transport.fail_on("backup");

        let err = orch.create_backup(&server.id, "b1").await.unwrap_err();
        assert!(matches!(err, LifecycleError::RemoteFailure(_)));

        let backups = store.list_backups_for_server(&server.id).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].status, BackupStatus::Failed);
        assert!(backups[0].error.as_deref().unwrap().contains("backup"));
    }

    #[tokio::test]
    async fn backup_completion_callback() {
        let (orch, _, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        let backup = orch.create_backup(&server.id, "b1").await.unwrap();

        let done = orch
            .backup_completed(&server.id, &backup.id, "aabb1122", 4096)
            .unwrap();
        assert_eq!(done.status, BackupStatus::Completed);
        assert_eq!(done.checksum.as_deref(), Some("aabb1122"));
        assert_eq!(done.size_bytes, 4096);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn backup_failure_callback() {
        let (orch, _, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        let backup = orch.create_backup(&server.id, "b1").await.unwrap();

        let failed = orch
            .backup_failed(&server.id, &backup.id, "disk full")
            .unwrap();
        assert_eq!(failed.status, BackupStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
    }

    // ── Reinstall ──────────────────────────────────────────────────

    #[tokio::test]
    async fn reinstall_from_error_state() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        transport.fail_on("start");
        orch.start_server(&server.id).await.unwrap_err();

        let reinstalled = orch.reinstall_server(&server.id).await.unwrap();
        assert_eq!(reinstalled.status, ServerStatus::Installing);
        assert_eq!(transport.count("reinstall"), 1);

        let done = orch.mark_installed(&server.id).await.unwrap();
        assert_eq!(done.status, ServerStatus::Stopped);
    }

    // ── Delete ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn delete_releases_capacity_exactly_once() {
        let (orch, _, store) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        orch.create_backup(&server.id, "b1").await.unwrap();

        orch.delete_server(&server.id).await.unwrap();

        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 0);
        assert_eq!(node.disk_allocated_mb, 0);
        assert_eq!(node.cpu_allocated_pct, 0);
        assert!(store.get_server(&server.id).unwrap().is_none());
        assert!(store.list_backups_for_server(&server.id).unwrap().is_empty());
        let allocs = store.list_allocations_for_node("node-1").unwrap();
        assert!(allocs[0].server_id.is_none());

        // A second delete finds nothing and cannot double-release.
        let err = orch.delete_server(&server.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 0);
    }

    #[tokio::test]
    async fn delete_proceeds_despite_remote_failure() {
        let (orch, transport, store) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;
        orch.start_server(&server.id).await.unwrap();
        transport.fail_on("kill");
        transport.fail_on("delete");

        orch.delete_server(&server.id).await.unwrap();
        assert!(store.get_server(&server.id).unwrap().is_none());
        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 0);
    }

    // ── Queries ────────────────────────────────────────────────────

    #[tokio::test]
    async fn stats_passthrough() {
        let (orch, transport, _) = setup(4096, &[25565]);
        let server = installed_server(&orch, 1024).await;

        orch.server_stats(&server.id).await.unwrap();
        assert_eq!(transport.count("stats"), 1);

        transport.fail_on("stats");
        let err = orch.server_stats(&server.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::RemoteFailure(_)));
    }

    #[tokio::test]
    async fn node_specs_carry_bound_allocations() {
        let (orch, _, _) = setup(8192, &[25565, 25566]);
        let first = installed_server(&orch, 1024).await;
        installed_server(&orch, 1024).await;

        let specs = orch.server_specs_for_node("node-1").unwrap();
        assert_eq!(specs.len(), 2);
        let spec = specs.iter().find(|s| s.server_id == first.id).unwrap();
        assert_eq!(spec.allocations.len(), 1);
        assert_eq!(spec.allocations[0].port, 25565);
        assert!(spec.allocations[0].is_primary);

        assert!(matches!(
            orch.server_specs_for_node("ghost").unwrap_err(),
            LifecycleError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let (orch, _, _) = setup(4096, &[25565]);
        assert!(matches!(
            orch.start_server("ghost").await.unwrap_err(),
            LifecycleError::NotFound(_)
        ));
        assert!(matches!(
            orch.get_server("ghost").unwrap_err(),
            LifecycleError::NotFound(_)
        ));
    }
}
