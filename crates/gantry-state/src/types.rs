//! Domain types for the Gantry state store.
//!
//! These types represent the persisted inventory of the control plane:
//! nodes, locations, port allocations, servers, and backups, plus the wire
//! types exchanged with node agents. All types are serializable to/from
//! JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a node.
pub type NodeId = String;

/// Unique identifier for a location.
pub type LocationId = String;

/// Unique identifier for a port allocation.
pub type AllocationId = String;

/// Unique identifier for a server.
pub type ServerId = String;

/// Unique identifier for a backup.
pub type BackupId = String;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Location ──────────────────────────────────────────────────────

/// A physical or logical grouping of nodes (datacenter, region).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub id: LocationId,
    /// Short code used in listings (e.g. "fra1").
    pub short_code: String,
    pub name: String,
    pub description: String,
    pub created_at: u64,
}

// ── Node ──────────────────────────────────────────────────────────

/// A physical host running the gantry agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub description: String,
    pub location_id: LocationId,
    /// Hostname the panel reaches the agent at.
    pub fqdn: String,
    /// "http" or "https".
    pub scheme: String,
    /// Port the agent's API listens on.
    pub daemon_port: u16,
    /// Port the agent's SFTP subsystem binds (configuration only).
    pub sftp_port: u16,
    /// Shared secret for panel <-> agent authentication.
    pub daemon_token: String,
    /// Physical memory on the node (MB).
    pub memory_total_mb: u64,
    /// Memory promised to servers (MB). Mutated only by reserve/release.
    pub memory_allocated_mb: u64,
    /// Percentage of memory overcommit allowed (0 = none).
    pub memory_overalloc_pct: u32,
    /// Physical disk on the node (MB).
    pub disk_total_mb: u64,
    /// Disk promised to servers (MB). Mutated only by reserve/release.
    pub disk_allocated_mb: u64,
    /// Percentage of disk overcommit allowed.
    pub disk_overalloc_pct: u32,
    /// Total CPU capacity in percent (100 per core). Never overcommitted.
    pub cpu_total_pct: u32,
    /// CPU promised to servers (percent).
    pub cpu_allocated_pct: u32,
    /// Whether the agent has checked in recently.
    pub is_online: bool,
    /// Drained nodes receive no new placements.
    pub maintenance_mode: bool,
    /// Unix timestamp of the last agent check-in.
    pub last_checked_at: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Node {
    /// Memory still reservable on this node (MB), honoring overcommit.
    pub fn available_memory_mb(&self) -> u64 {
        let ceiling = self
            .memory_total_mb
            .saturating_mul(100 + self.memory_overalloc_pct as u64)
            / 100;
        ceiling.saturating_sub(self.memory_allocated_mb)
    }

    /// Disk still reservable on this node (MB), honoring overcommit.
    pub fn available_disk_mb(&self) -> u64 {
        let ceiling = self
            .disk_total_mb
            .saturating_mul(100 + self.disk_overalloc_pct as u64)
            / 100;
        ceiling.saturating_sub(self.disk_allocated_mb)
    }

    /// CPU still reservable on this node (percent). No overcommit.
    pub fn available_cpu_pct(&self) -> u32 {
        self.cpu_total_pct.saturating_sub(self.cpu_allocated_pct)
    }
}

// ── Allocation ────────────────────────────────────────────────────

/// An (ip, port) pair on a node, bindable to at most one server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub id: AllocationId,
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
    /// Optional display alias (e.g. a DNS name for the ip).
    pub alias: String,
    /// The server this allocation is bound to, if any.
    pub server_id: Option<ServerId>,
    /// Whether this is the server's primary allocation.
    pub is_primary: bool,
    pub created_at: u64,
}

impl Allocation {
    /// Build the composite key for the allocations table.
    pub fn table_key(&self) -> String {
        allocation_key(&self.node_id, self.port, &self.ip)
    }
}

/// Composite allocation key: `{node_id}:{port:05}:{ip}`.
pub fn allocation_key(node_id: &str, port: u16, ip: &str) -> String {
    format!("{node_id}:{port:05}:{ip}")
}

// ── Server ────────────────────────────────────────────────────────

/// Lifecycle status of a server, as last observed by the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Installing,
    Starting,
    Running,
    Stopping,
    Stopped,
    Restarting,
    Suspended,
    Error,
}

impl ServerStatus {
    /// Whether the server is (or is becoming) live on its node.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServerStatus::Running | ServerStatus::Starting | ServerStatus::Restarting
        )
    }
}

/// Resource envelope for a server's container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// Hard memory limit (MB).
    pub memory_mb: u64,
    /// Swap on top of memory (MB).
    pub swap_mb: u64,
    /// Disk quota (MB).
    pub disk_mb: u64,
    /// CPU limit in percent (100 per core).
    pub cpu_pct: u32,
    /// Block IO weight (10-1000).
    pub io_weight: u16,
}

/// A game server managed by the panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Server {
    pub id: ServerId,
    /// First 8 hex chars of the id, used in URLs and container names.
    pub short_id: String,
    pub name: String,
    pub description: String,
    pub owner_id: String,
    pub node_id: NodeId,
    /// Composite key of the primary allocation in the allocations table.
    pub allocation_key: String,
    pub status: ServerStatus,
    pub suspended: bool,
    pub suspended_reason: Option<String>,
    /// Container image the server runs.
    pub image: String,
    /// Startup command passed to the container.
    pub startup_cmd: String,
    /// Environment injected into the container.
    pub env: HashMap<String, String>,
    pub limits: ResourceLimits,
    /// Maximum number of retained backups.
    pub backup_limit: u32,
    /// Container id reported by the node, once materialized.
    pub container_id: Option<String>,
    /// Unix timestamp when installation finished.
    pub installed_at: Option<u64>,
    /// Unix timestamp of the last successful start.
    pub last_started_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Backup ────────────────────────────────────────────────────────

/// Lifecycle status of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Deleted,
}

/// A point-in-time archive of a server's data directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backup {
    pub id: BackupId,
    pub server_id: ServerId,
    pub name: String,
    pub status: BackupStatus,
    /// SHA-256 of the archive, set on completion.
    pub checksum: Option<String>,
    pub size_bytes: u64,
    /// Locked backups cannot be deleted.
    pub is_locked: bool,
    /// Failure message, set when status is Failed.
    pub error: Option<String>,
    pub completed_at: Option<u64>,
    pub created_at: u64,
}

impl Backup {
    /// Build the composite key for the backups table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.server_id, self.id)
    }
}

// ── Wire types (panel <-> agent) ──────────────────────────────────

/// One exposed (ip, port) pair in a server spec sent to the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortAllocation {
    pub ip: String,
    pub port: u16,
    pub is_primary: bool,
}

/// An extra bind mount in a server spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything the agent needs to materialize a server's container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSpec {
    pub server_id: ServerId,
    pub short_id: String,
    pub image: String,
    pub startup_cmd: String,
    pub env: HashMap<String, String>,
    pub limits: ResourceLimits,
    pub allocations: Vec<PortAllocation>,
    pub mounts: Vec<MountSpec>,
}

/// Point-in-time resource usage of a running server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerStats {
    /// Container state string as reported by the engine.
    pub state: String,
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub uptime_secs: u64,
}

/// Static facts about a node, reported by its agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemInfo {
    pub version: String,
    pub kernel: String,
    pub os: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
}
