//! Node and location administration.
//!
//! Nodes are registered manually by an operator, then claimed by their
//! agent: on startup the agent announces itself with the node's daemon
//! token, which marks the node online and records the port it actually
//! listens on. A liveness sweep flips nodes back offline when they stop
//! checking in.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use gantry_state::{Allocation, Location, Node, StateStore, allocation_key, epoch_secs};

use crate::error::{LifecycleError, LifecycleResult};

/// Request payload for creating or updating a node.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub location_id: String,
    pub fqdn: String,
    pub scheme: String,
    pub daemon_port: u16,
    pub sftp_port: u16,
    pub memory_total_mb: u64,
    #[serde(default)]
    pub memory_overalloc_pct: u32,
    pub disk_total_mb: u64,
    #[serde(default)]
    pub disk_overalloc_pct: u32,
    pub cpu_total_pct: u32,
}

/// The configuration document an agent bootstraps from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfiguration {
    pub debug: bool,
    pub uuid: String,
    /// First 16 chars of the token, used as a key id in logs.
    pub token_id: String,
    pub token: String,
    pub api: ApiSection,
    pub system: SystemSection,
    pub allowed_mounts: Vec<String>,
    /// Base URL of the control plane.
    pub remote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    pub host: String,
    pub port: u16,
    pub ssl: SslSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslSection {
    pub enabled: bool,
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSection {
    /// Directory server data directories live under.
    pub data: String,
    pub sftp: SftpSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpSection {
    pub bind_port: u16,
}

/// 32 bytes of entropy, hex-encoded: the panel/agent shared secret.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Random 128-bit identifier rendered as 32 hex chars.
fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Administers nodes, locations, and their port allocations.
#[derive(Clone)]
pub struct NodeManager {
    state: StateStore,
}

impl NodeManager {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    fn must_node(&self, node_id: &str) -> LifecycleResult<Node> {
        self.state
            .get_node(node_id)?
            .ok_or_else(|| LifecycleError::NotFound(format!("node {node_id}")))
    }

    fn validate(&self, req: &CreateNodeRequest) -> LifecycleResult<()> {
        if req.name.trim().is_empty() {
            return Err(LifecycleError::Validation("node name is required".into()));
        }
        if req.fqdn.trim().is_empty() {
            return Err(LifecycleError::Validation("fqdn is required".into()));
        }
        if req.scheme != "http" && req.scheme != "https" {
            return Err(LifecycleError::Validation(
                "scheme must be http or https".into(),
            ));
        }
        if req.memory_total_mb == 0 || req.disk_total_mb == 0 || req.cpu_total_pct == 0 {
            return Err(LifecycleError::Validation(
                "memory, disk, and cpu totals must be positive".into(),
            ));
        }
        if req.memory_overalloc_pct > 500 || req.disk_overalloc_pct > 500 {
            return Err(LifecycleError::Validation(
                "overallocation must be at most 500 percent".into(),
            ));
        }
        if self.state.get_location(&req.location_id)?.is_none() {
            return Err(LifecycleError::Validation(format!(
                "location {} not found",
                req.location_id
            )));
        }
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Register a new node. Generates its daemon token; the operator copies
    /// the configuration document to the host before starting the agent.
    pub fn create_node(&self, req: CreateNodeRequest) -> LifecycleResult<Node> {
        self.validate(&req)?;
        if self.state.get_node_by_fqdn(&req.fqdn)?.is_some() {
            return Err(LifecycleError::Conflict(format!(
                "a node with fqdn {} already exists",
                req.fqdn
            )));
        }

        let now = epoch_secs();
        let node = Node {
            id: generate_id(),
            name: req.name,
            description: req.description,
            location_id: req.location_id,
            fqdn: req.fqdn,
            scheme: req.scheme,
            daemon_port: req.daemon_port,
            sftp_port: req.sftp_port,
            daemon_token: generate_token(),
            memory_total_mb: req.memory_total_mb,
            memory_allocated_mb: 0,
            memory_overalloc_pct: req.memory_overalloc_pct,
            disk_total_mb: req.disk_total_mb,
            disk_allocated_mb: 0,
            disk_overalloc_pct: req.disk_overalloc_pct,
            cpu_total_pct: req.cpu_total_pct,
            cpu_allocated_pct: 0,
            is_online: false,
            maintenance_mode: false,
            last_checked_at: 0,
            created_at: now,
            updated_at: now,
        };
        self.state.put_node(&node)?;
        info!(node_id = %node.id, fqdn = %node.fqdn, "node created");
        Ok(node)
    }

    /// Update a node's description and capacity. Allocated counters and the
    /// daemon token are preserved.
    pub fn update_node(&self, node_id: &str, req: CreateNodeRequest) -> LifecycleResult<Node> {
        self.validate(&req)?;
        let mut node = self.must_node(node_id)?;
        if let Some(existing) = self.state.get_node_by_fqdn(&req.fqdn)? {
            if existing.id != node_id {
                return Err(LifecycleError::Conflict(format!(
                    "a node with fqdn {} already exists",
                    req.fqdn
                )));
            }
        }

        node.name = req.name;
        node.description = req.description;
        node.location_id = req.location_id;
        node.fqdn = req.fqdn;
        node.scheme = req.scheme;
        node.daemon_port = req.daemon_port;
        node.sftp_port = req.sftp_port;
        node.memory_total_mb = req.memory_total_mb;
        node.memory_overalloc_pct = req.memory_overalloc_pct;
        node.disk_total_mb = req.disk_total_mb;
        node.disk_overalloc_pct = req.disk_overalloc_pct;
        node.cpu_total_pct = req.cpu_total_pct;
        node.updated_at = epoch_secs();
        self.state.put_node(&node)?;
        Ok(node)
    }

    pub fn get_node(&self, node_id: &str) -> LifecycleResult<Node> {
        self.must_node(node_id)
    }

    pub fn list_nodes(&self) -> LifecycleResult<Vec<Node>> {
        Ok(self.state.list_nodes()?)
    }

    /// Delete a node and its allocations. Refused while servers live on it.
    pub fn delete_node(&self, node_id: &str) -> LifecycleResult<()> {
        self.must_node(node_id)?;
        let servers = self.state.count_servers_for_node(node_id)?;
        if servers > 0 {
            return Err(LifecycleError::Conflict(format!(
                "node {node_id} still has {servers} servers"
            )));
        }

        for alloc in self.state.list_allocations_for_node(node_id)? {
            self.state.delete_allocation(&alloc.table_key())?;
        }
        self.state.delete_node(node_id)?;
        info!(%node_id, "node deleted");
        Ok(())
    }

    pub fn set_maintenance(&self, node_id: &str, maintenance: bool) -> LifecycleResult<Node> {
        let mut node = self.must_node(node_id)?;
        node.maintenance_mode = maintenance;
        node.updated_at = epoch_secs();
        self.state.put_node(&node)?;
        info!(%node_id, maintenance, "node maintenance mode set");
        Ok(node)
    }

    /// Rotate the daemon token. The agent must be reconfigured afterwards.
    pub fn regenerate_token(&self, node_id: &str) -> LifecycleResult<Node> {
        let mut node = self.must_node(node_id)?;
        node.daemon_token = generate_token();
        node.is_online = false;
        node.updated_at = epoch_secs();
        self.state.put_node(&node)?;
        info!(%node_id, "node token regenerated");
        Ok(node)
    }

    /// Agent announce handshake: verify the token, mark the node online,
    /// and record the port the agent actually listens on.
    pub fn register_node(&self, node_id: &str, token: &str, port: u16) -> LifecycleResult<Node> {
        let mut node = self.must_node(node_id)?;
        if node.daemon_token != token {
            return Err(LifecycleError::Validation(
                "node token mismatch".to_string(),
            ));
        }

        node.is_online = true;
        node.daemon_port = port;
        node.last_checked_at = epoch_secs();
        node.updated_at = epoch_secs();
        self.state.put_node(&node)?;
        info!(%node_id, port, "node registered");
        Ok(node)
    }

    /// Build the configuration document the node's agent bootstraps from.
    pub fn configuration(
        &self,
        node_id: &str,
        remote_base: &str,
    ) -> LifecycleResult<NodeConfiguration> {
        let node = self.must_node(node_id)?;
        let token_id: String = node.daemon_token.chars().take(16).collect();
        Ok(NodeConfiguration {
            debug: false,
            uuid: node.id.clone(),
            token_id,
            token: node.daemon_token.clone(),
            api: ApiSection {
                host: node.fqdn.clone(),
                port: node.daemon_port,
                ssl: SslSection {
                    enabled: node.scheme == "https",
                    cert: format!("/etc/letsencrypt/live/{}/fullchain.pem", node.fqdn),
                    key: format!("/etc/letsencrypt/live/{}/privkey.pem", node.fqdn),
                },
            },
            system: SystemSection {
                data: "/var/lib/gantry/volumes".to_string(),
                sftp: SftpSection {
                    bind_port: node.sftp_port,
                },
            },
            allowed_mounts: Vec::new(),
            remote: remote_base.to_string(),
        })
    }

    /// Flip nodes offline when their last check-in is older than
    /// `threshold_secs`. Returns how many were marked.
    pub fn mark_stale_nodes(&self, threshold_secs: u64) -> LifecycleResult<u32> {
        let now = epoch_secs();
        let mut marked = 0;
        for mut node in self.state.list_nodes()? {
            if node.is_online && node.last_checked_at + threshold_secs < now {
                node.is_online = false;
                node.updated_at = now;
                self.state.put_node(&node)?;
                debug!(node_id = %node.id, "node marked offline");
                marked += 1;
            }
        }
        Ok(marked)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Create allocations for every port in `[port_start, port_end]` on
    /// `ip`, skipping ports already allocated there.
    pub fn create_allocations(
        &self,
        node_id: &str,
        ip: &str,
        port_start: u16,
        port_end: u16,
        alias: &str,
    ) -> LifecycleResult<Vec<Allocation>> {
        self.must_node(node_id)?;
        if port_start > port_end {
            return Err(LifecycleError::Validation(
                "port range start exceeds end".into(),
            ));
        }
        if port_start < 1024 {
            return Err(LifecycleError::Validation(
                "ports below 1024 cannot be allocated".into(),
            ));
        }

        let taken: Vec<u16> = self
            .state
            .list_allocations_for_node(node_id)?
            .into_iter()
            .filter(|a| a.ip == ip)
            .map(|a| a.port)
            .collect();

        let now = epoch_secs();
        let mut created = Vec::new();
        for port in port_start..=port_end {
            if taken.contains(&port) {
                continue;
            }
            let alloc = Allocation {
                id: generate_id(),
                node_id: node_id.to_string(),
                ip: ip.to_string(),
                port,
                alias: alias.to_string(),
                server_id: None,
                is_primary: false,
                created_at: now,
            };
            self.state.put_allocation(&alloc)?;
            created.push(alloc);
        }

        if created.is_empty() {
            return Err(LifecycleError::Conflict(format!(
                "every port in {port_start}-{port_end} on {ip} is already allocated"
            )));
        }
        info!(%node_id, %ip, count = created.len(), "allocations created");
        Ok(created)
    }

    pub fn list_allocations(&self, node_id: &str) -> LifecycleResult<Vec<Allocation>> {
        self.must_node(node_id)?;
        Ok(self.state.list_allocations_for_node(node_id)?)
    }

    /// Delete an unbound allocation. Refused while a server holds it.
    pub fn delete_allocation(&self, node_id: &str, port: u16, ip: &str) -> LifecycleResult<()> {
        let key = allocation_key(node_id, port, ip);
        let alloc = self
            .state
            .get_allocation(&key)?
            .ok_or_else(|| LifecycleError::NotFound(format!("allocation {key}")))?;
        if let Some(server_id) = alloc.server_id {
            return Err(LifecycleError::Conflict(format!(
                "allocation is bound to server {server_id}"
            )));
        }
        self.state.delete_allocation(&key)?;
        Ok(())
    }

    // ── Locations ──────────────────────────────────────────────────

    pub fn create_location(
        &self,
        short_code: &str,
        name: &str,
        description: &str,
    ) -> LifecycleResult<Location> {
        if short_code.trim().is_empty() {
            return Err(LifecycleError::Validation("short code is required".into()));
        }
        let location = Location {
            id: generate_id(),
            short_code: short_code.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: epoch_secs(),
        };
        self.state.put_location(&location)?;
        Ok(location)
    }

    pub fn list_locations(&self) -> LifecycleResult<Vec<Location>> {
        Ok(self.state.list_locations()?)
    }

    /// Delete a location. Refused while nodes are assigned to it.
    pub fn delete_location(&self, location_id: &str) -> LifecycleResult<()> {
        if self.state.get_location(location_id)?.is_none() {
            return Err(LifecycleError::NotFound(format!(
                "location {location_id}"
            )));
        }
        let nodes = self.state.count_nodes_for_location(location_id)?;
        if nodes > 0 {
            return Err(LifecycleError::Conflict(format!(
                "location {location_id} still has {nodes} nodes"
            )));
        }
        self.state.delete_location(location_id)?;
        Ok(())
    }
}
