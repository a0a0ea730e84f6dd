//! StateStore — redb-backed inventory persistence for Gantry.
//!
//! Provides typed CRUD operations over nodes, locations, allocations,
//! servers, and backups. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Capacity accounting is transactional: `reserve_on_node` performs the
//! availability check, the first-fit allocation bind, and the counter bump
//! inside one write transaction. redb serializes write transactions, so two
//! concurrent reserves can never both pass the same capacity check.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Result of a capacity reservation attempt. Only `Reserved` writes anything.
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    /// Capacity was reserved and the returned allocation bound to the server.
    Reserved(Allocation),
    /// The node does not exist.
    NodeMissing,
    /// Not enough memory within the overcommit ceiling.
    InsufficientMemory { available_mb: u64 },
    /// Not enough disk within the overcommit ceiling.
    InsufficientDisk { available_mb: u64 },
    /// Not enough CPU (never overcommitted).
    InsufficientCpu { available_pct: u32 },
    /// All of the node's allocations are already bound.
    NoFreeAllocation,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
        txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        txn.open_table(SERVERS).map_err(map_err!(Table))?;
        txn.open_table(BACKUPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Locations ──────────────────────────────────────────────────

    /// Insert or update a location.
    pub fn put_location(&self, location: &Location) -> StateResult<()> {
        let value = serde_json::to_vec(location).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
            table
                .insert(location.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a location by ID.
    pub fn get_location(&self, location_id: &str) -> StateResult<Option<Location>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
        match table.get(location_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let location: Location =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(location))
            }
            None => Ok(None),
        }
    }

    /// List all locations.
    pub fn list_locations(&self) -> StateResult<Vec<Location>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let location: Location =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(location);
        }
        Ok(results)
    }

    /// Delete a location by ID. Returns true if it existed.
    pub fn delete_location(&self, location_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
            existed = table.remove(location_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Count nodes assigned to a location.
    pub fn count_nodes_for_location(&self, location_id: &str) -> StateResult<u32> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: Node =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if node.location_id == location_id {
                count += 1;
            }
        }
        Ok(count)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = %node.id, "node stored");
        Ok(())
    }

    /// Get a node by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(node_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: Node =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// Find a node by FQDN (linear scan; node counts are small).
    pub fn get_node_by_fqdn(&self, fqdn: &str) -> StateResult<Option<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: Node =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if node.fqdn == fqdn {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// List all nodes.
    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: Node =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        Ok(results)
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, existed, "node deleted");
        Ok(existed)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Insert or update an allocation.
    pub fn put_allocation(&self, alloc: &Allocation) -> StateResult<()> {
        let key = alloc.table_key();
        let value = serde_json::to_vec(alloc).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an allocation by its composite key.
    pub fn get_allocation(&self, key: &str) -> StateResult<Option<Allocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let alloc: Allocation =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(alloc))
            }
            None => Ok(None),
        }
    }

    /// List a node's allocations in ascending port order.
    pub fn list_allocations_for_node(&self, node_id: &str) -> StateResult<Vec<Allocation>> {
        let prefix = format!("{node_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let alloc: Allocation =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(alloc);
            }
        }
        Ok(results)
    }

    /// Delete an allocation by key. Returns true if it existed.
    pub fn delete_allocation(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Servers ────────────────────────────────────────────────────

    /// Insert or update a server.
    pub fn put_server(&self, server: &Server) -> StateResult<()> {
        let value = serde_json::to_vec(server).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
            table
                .insert(server.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a server by ID.
    pub fn get_server(&self, server_id: &str) -> StateResult<Option<Server>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
        match table.get(server_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let server: Server =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(server))
            }
            None => Ok(None),
        }
    }

    /// Find a server by its 8-char short ID (linear scan).
    pub fn get_server_by_short_id(&self, short_id: &str) -> StateResult<Option<Server>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let server: Server =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if server.short_id == short_id {
                return Ok(Some(server));
            }
        }
        Ok(None)
    }

    /// List all servers.
    pub fn list_servers(&self) -> StateResult<Vec<Server>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let server: Server =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(server);
        }
        Ok(results)
    }

    /// List all servers placed on a node.
    pub fn list_servers_for_node(&self, node_id: &str) -> StateResult<Vec<Server>> {
        Ok(self
            .list_servers()?
            .into_iter()
            .filter(|s| s.node_id == node_id)
            .collect())
    }

    /// Count servers placed on a node.
    pub fn count_servers_for_node(&self, node_id: &str) -> StateResult<u32> {
        Ok(self.list_servers_for_node(node_id)?.len() as u32)
    }

    /// Delete a server by ID. Returns true if it existed.
    pub fn delete_server(&self, server_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
            existed = table.remove(server_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%server_id, existed, "server deleted");
        Ok(existed)
    }

    // ── Backups ────────────────────────────────────────────────────

    /// Insert or update a backup.
    pub fn put_backup(&self, backup: &Backup) -> StateResult<()> {
        let key = backup.table_key();
        let value = serde_json::to_vec(backup).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a backup by server and backup ID.
    pub fn get_backup(&self, server_id: &str, backup_id: &str) -> StateResult<Option<Backup>> {
        let key = format!("{server_id}:{backup_id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let backup: Backup =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(backup))
            }
            None => Ok(None),
        }
    }

    /// List all backups for a server.
    pub fn list_backups_for_server(&self, server_id: &str) -> StateResult<Vec<Backup>> {
        let prefix = format!("{server_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let backup: Backup =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(backup);
            }
        }
        Ok(results)
    }

    /// Count a server's backups that occupy a retention slot
    /// (everything except deleted ones).
    pub fn count_backups_for_server(&self, server_id: &str) -> StateResult<u32> {
        Ok(self
            .list_backups_for_server(server_id)?
            .iter()
            .filter(|b| b.status != BackupStatus::Deleted)
            .count() as u32)
    }

    /// Delete all backup rows for a server. Returns number deleted.
    pub fn delete_backups_for_server(&self, server_id: &str) -> StateResult<u32> {
        let prefix = format!("{server_id}:");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect()
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Capacity transactions ──────────────────────────────────────

    /// Reserve capacity for a server on a node.
    ///
    /// In a single write transaction: checks memory/disk availability
    /// against the overcommit ceilings and CPU against the raw total, finds
    /// the node's lowest-port unbound allocation, binds it to `server_id`,
    /// and adds the requested amounts to the node's allocated counters.
    /// Any failed check leaves the database untouched.
    pub fn reserve_on_node(
        &self,
        node_id: &str,
        server_id: &str,
        limits: &ResourceLimits,
    ) -> StateResult<ReserveOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut allocs = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;

            let node: Option<Node> = match nodes.get(node_id).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };

            match node {
                None => ReserveOutcome::NodeMissing,
                Some(mut node) => {
                    if node.available_memory_mb() < limits.memory_mb {
                        ReserveOutcome::InsufficientMemory {
                            available_mb: node.available_memory_mb(),
                        }
                    } else if node.available_disk_mb() < limits.disk_mb {
                        ReserveOutcome::InsufficientDisk {
                            available_mb: node.available_disk_mb(),
                        }
                    } else if node.available_cpu_pct() < limits.cpu_pct {
                        ReserveOutcome::InsufficientCpu {
                            available_pct: node.available_cpu_pct(),
                        }
                    } else {
                        // First unbound allocation in key order, which is
                        // ascending port order by key construction.
                        let prefix = format!("{node_id}:");
                        let mut found: Option<(String, Allocation)> = None;
                        for entry in allocs.iter().map_err(map_err!(Read))? {
                            let (key, value) = entry.map_err(map_err!(Read))?;
                            if !key.value().starts_with(&prefix) {
                                continue;
                            }
                            let alloc: Allocation = serde_json::from_slice(value.value())
                                .map_err(map_err!(Deserialize))?;
                            if alloc.server_id.is_none() {
                                found = Some((key.value().to_string(), alloc));
                                break;
                            }
                        }
                        match found {
                            None => ReserveOutcome::NoFreeAllocation,
                            Some((key, mut alloc)) => {
                                alloc.server_id = Some(server_id.to_string());
                                alloc.is_primary = true;
                                let alloc_value = serde_json::to_vec(&alloc)
                                    .map_err(map_err!(Serialize))?;
                                allocs
                                    .insert(key.as_str(), alloc_value.as_slice())
                                    .map_err(map_err!(Write))?;

                                node.memory_allocated_mb += limits.memory_mb;
                                node.disk_allocated_mb += limits.disk_mb;
                                node.cpu_allocated_pct += limits.cpu_pct;
                                node.updated_at = epoch_secs();
                                let node_value = serde_json::to_vec(&node)
                                    .map_err(map_err!(Serialize))?;
                                nodes
                                    .insert(node_id, node_value.as_slice())
                                    .map_err(map_err!(Write))?;

                                ReserveOutcome::Reserved(alloc)
                            }
                        }
                    }
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, %server_id, ?outcome, "capacity reservation attempted");
        Ok(outcome)
    }

    /// Release a previously reserved allocation and return its resources
    /// to the node's counters.
    ///
    /// Idempotent: if the allocation is already unbound (or missing), the
    /// call returns `false` and writes nothing, so a retried delete can
    /// never release capacity twice.
    pub fn release_on_node(
        &self,
        allocation_key: &str,
        limits: &ResourceLimits,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released = {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut allocs = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;

            let alloc: Option<Allocation> =
                match allocs.get(allocation_key).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };

            match alloc {
                Some(mut alloc) if alloc.server_id.is_some() => {
                    alloc.server_id = None;
                    alloc.is_primary = false;
                    let alloc_value =
                        serde_json::to_vec(&alloc).map_err(map_err!(Serialize))?;
                    allocs
                        .insert(allocation_key, alloc_value.as_slice())
                        .map_err(map_err!(Write))?;

                    let node: Option<Node> =
                        match nodes.get(alloc.node_id.as_str()).map_err(map_err!(Read))? {
                            Some(guard) => Some(
                                serde_json::from_slice(guard.value())
                                    .map_err(map_err!(Deserialize))?,
                            ),
                            None => None,
                        };
                    if let Some(mut node) = node {
                        node.memory_allocated_mb =
                            node.memory_allocated_mb.saturating_sub(limits.memory_mb);
                        node.disk_allocated_mb =
                            node.disk_allocated_mb.saturating_sub(limits.disk_mb);
                        node.cpu_allocated_pct =
                            node.cpu_allocated_pct.saturating_sub(limits.cpu_pct);
                        node.updated_at = epoch_secs();
                        let node_value =
                            serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
                        nodes
                            .insert(alloc.node_id.as_str(), node_value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    true
                }
                _ => false,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%allocation_key, released, "capacity release attempted");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            location_id: "loc-1".to_string(),
            fqdn: format!("{id}.example.com"),
            scheme: "http".to_string(),
            daemon_port: 8080,
            sftp_port: 2022,
            daemon_token: "a".repeat(64),
            memory_total_mb: 4096,
            memory_allocated_mb: 0,
            memory_overalloc_pct: 0,
            disk_total_mb: 51200,
            disk_allocated_mb: 0,
            disk_overalloc_pct: 0,
            cpu_total_pct: 400,
            cpu_allocated_pct: 0,
            is_online: true,
            maintenance_mode: false,
            last_checked_at: 1000,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_allocation(node_id: &str, port: u16) -> Allocation {
        Allocation {
            id: format!("alloc-{port}"),
            node_id: node_id.to_string(),
            ip: "10.0.0.1".to_string(),
            port,
            alias: String::new(),
            server_id: None,
            is_primary: false,
            created_at: 1000,
        }
    }

    fn test_server(id: &str, node_id: &str) -> Server {
        Server {
            id: id.to_string(),
            short_id: id.chars().take(8).collect(),
            name: format!("srv {id}"),
            description: String::new(),
            owner_id: "owner-1".to_string(),
            node_id: node_id.to_string(),
            allocation_key: allocation_key(node_id, 25565, "10.0.0.1"),
            status: ServerStatus::Stopped,
            suspended: false,
            suspended_reason: None,
            image: "ghcr.io/example/minecraft:java17".to_string(),
            startup_cmd: "java -jar server.jar".to_string(),
            env: HashMap::new(),
            limits: test_limits(),
            backup_limit: 2,
            container_id: None,
            installed_at: Some(1000),
            last_started_at: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_limits() -> ResourceLimits {
        ResourceLimits {
            memory_mb: 2048,
            swap_mb: 4096,
            disk_mb: 10240,
            cpu_pct: 200,
            io_weight: 500,
        }
    }

    fn test_backup(server_id: &str, id: &str) -> Backup {
        Backup {
            id: id.to_string(),
            server_id: server_id.to_string(),
            name: format!("backup {id}"),
            status: BackupStatus::Completed,
            checksum: Some("deadbeef".to_string()),
            size_bytes: 1024,
            is_locked: false,
            error: None,
            completed_at: Some(1100),
            created_at: 1000,
        }
    }

    // ── Node CRUD ──────────────────────────────────────────────────

    #[test]
    fn node_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let node = test_node("node-1");

        store.put_node(&node).unwrap();
        let retrieved = store.get_node("node-1").unwrap();

        assert_eq!(retrieved, Some(node));
    }

    #[test]
    fn node_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_node("nope").unwrap().is_none());
    }

    #[test]
    fn node_lookup_by_fqdn() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1")).unwrap();
        store.put_node(&test_node("node-2")).unwrap();

        let found = store.get_node_by_fqdn("node-2.example.com").unwrap();
        assert_eq!(found.unwrap().id, "node-2");
        assert!(store.get_node_by_fqdn("other.example.com").unwrap().is_none());
    }

    #[test]
    fn node_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1")).unwrap();

        assert!(store.delete_node("node-1").unwrap());
        assert!(!store.delete_node("node-1").unwrap());
        assert!(store.get_node("node-1").unwrap().is_none());
    }

    // ── Location CRUD ──────────────────────────────────────────────

    #[test]
    fn location_put_get_list() {
        let store = StateStore::open_in_memory().unwrap();
        let loc = Location {
            id: "loc-1".to_string(),
            short_code: "fra1".to_string(),
            name: "Frankfurt".to_string(),
            description: String::new(),
            created_at: 1000,
        };

        store.put_location(&loc).unwrap();
        assert_eq!(store.get_location("loc-1").unwrap(), Some(loc));
        assert_eq!(store.list_locations().unwrap().len(), 1);
    }

    #[test]
    fn location_counts_its_nodes() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1")).unwrap();
        store.put_node(&test_node("node-2")).unwrap();
        let mut other = test_node("node-3");
        other.location_id = "loc-2".to_string();
        store.put_node(&other).unwrap();

        assert_eq!(store.count_nodes_for_location("loc-1").unwrap(), 2);
        assert_eq!(store.count_nodes_for_location("loc-2").unwrap(), 1);
    }

    // ── Allocation CRUD ────────────────────────────────────────────

    #[test]
    fn allocations_listed_in_port_order() {
        let store = StateStore::open_in_memory().unwrap();
        for port in [25570u16, 25565, 25568] {
            store.put_allocation(&test_allocation("node-1", port)).unwrap();
        }

        let allocs = store.list_allocations_for_node("node-1").unwrap();
        let ports: Vec<u16> = allocs.iter().map(|a| a.port).collect();
        assert_eq!(ports, vec![25565, 25568, 25570]);
    }

    #[test]
    fn allocation_list_scoped_to_node() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_allocation(&test_allocation("node-1", 25565)).unwrap();
        store.put_allocation(&test_allocation("node-2", 25565)).unwrap();

        assert_eq!(store.list_allocations_for_node("node-1").unwrap().len(), 1);
    }

    // ── Server CRUD ────────────────────────────────────────────────

    #[test]
    fn server_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let server = test_server("aabbccdd-1111", "node-1");

        store.put_server(&server).unwrap();
        assert_eq!(store.get_server("aabbccdd-1111").unwrap(), Some(server));
    }

    #[test]
    fn server_lookup_by_short_id() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_server(&test_server("aabbccdd-1111", "node-1")).unwrap();

        let found = store.get_server_by_short_id("aabbccdd").unwrap();
        assert_eq!(found.unwrap().id, "aabbccdd-1111");
    }

    #[test]
    fn servers_counted_per_node() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_server(&test_server("s1", "node-1")).unwrap();
        store.put_server(&test_server("s2", "node-1")).unwrap();
        store.put_server(&test_server("s3", "node-2")).unwrap();

        assert_eq!(store.count_servers_for_node("node-1").unwrap(), 2);
        assert_eq!(store.count_servers_for_node("node-2").unwrap(), 1);
        assert_eq!(store.count_servers_for_node("node-3").unwrap(), 0);
    }

    #[test]
    fn server_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_server(&test_server("s1", "node-1")).unwrap();

        assert!(store.delete_server("s1").unwrap());
        assert!(!store.delete_server("s1").unwrap());
    }

    // ── Backup CRUD ────────────────────────────────────────────────

    #[test]
    fn backup_put_list_and_delete_all() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_backup(&test_backup("s1", "b1")).unwrap();
        store.put_backup(&test_backup("s1", "b2")).unwrap();
        store.put_backup(&test_backup("s2", "b1")).unwrap();

        assert_eq!(store.list_backups_for_server("s1").unwrap().len(), 2);
        assert_eq!(store.delete_backups_for_server("s1").unwrap(), 2);
        assert!(store.list_backups_for_server("s1").unwrap().is_empty());
        // s2 untouched
        assert_eq!(store.list_backups_for_server("s2").unwrap().len(), 1);
    }

    #[test]
    fn backup_count_skips_deleted() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_backup(&test_backup("s1", "b1")).unwrap();
        let mut deleted = test_backup("s1", "b2");
        deleted.status = BackupStatus::Deleted;
        store.put_backup(&deleted).unwrap();

        assert_eq!(store.count_backups_for_server("s1").unwrap(), 1);
    }

    // ── Capacity transactions ──────────────────────────────────────

    #[test]
    fn reserve_binds_lowest_port_first() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1")).unwrap();
        for port in [25570u16, 25565, 25568] {
            store.put_allocation(&test_allocation("node-1", port)).unwrap();
        }

        let outcome = store
            .reserve_on_node("node-1", "s1", &test_limits())
            .unwrap();
        match outcome {
            ReserveOutcome::Reserved(alloc) => {
                assert_eq!(alloc.port, 25565);
                assert_eq!(alloc.server_id.as_deref(), Some("s1"));
                assert!(alloc.is_primary);
            }
            other => panic!("expected Reserved, got {other:?}"),
        }

        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 2048);
        assert_eq!(node.disk_allocated_mb, 10240);
        assert_eq!(node.cpu_allocated_pct, 200);

        // Next reserve takes the next-lowest port.
        let outcome = store
            .reserve_on_node("node-1", "s2", &test_limits())
            .unwrap();
        match outcome {
            ReserveOutcome::Reserved(alloc) => assert_eq!(alloc.port, 25568),
            other => panic!("expected Reserved, got {other:?}"),
        }
    }

    #[test]
    fn reserve_rejects_over_memory_without_mutation() {
        let store = StateStore::open_in_memory().unwrap();
        // 4096 MB node, no overcommit.
        store.put_node(&test_node("node-1")).unwrap();
        store.put_allocation(&test_allocation("node-1", 25565)).unwrap();
        store.put_allocation(&test_allocation("node-1", 25566)).unwrap();

        let mut limits = test_limits();
        limits.memory_mb = 2048;
        assert!(matches!(
            store.reserve_on_node("node-1", "s1", &limits).unwrap(),
            ReserveOutcome::Reserved(_)
        ));

        // 2049 more would exceed 4096.
        limits.memory_mb = 2049;
        let outcome = store.reserve_on_node("node-1", "s2", &limits).unwrap();
        assert_eq!(
            outcome,
            ReserveOutcome::InsufficientMemory { available_mb: 2048 }
        );

        // Nothing changed: counters stay at the first reservation, and the
        // second allocation is still unbound.
        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 2048);
        let allocs = store.list_allocations_for_node("node-1").unwrap();
        assert!(allocs[1].server_id.is_none());
    }

    #[test]
    fn reserve_honors_memory_overcommit() {
        let store = StateStore::open_in_memory().unwrap();
        let mut node = test_node("node-1");
        node.memory_overalloc_pct = 50; // ceiling 6144
        store.put_node(&node).unwrap();
        store.put_allocation(&test_allocation("node-1", 25565)).unwrap();
        store.put_allocation(&test_allocation("node-1", 25566)).unwrap();
        store.put_allocation(&test_allocation("node-1", 25567)).unwrap();

        let mut limits = test_limits();
        limits.memory_mb = 3000;
        assert!(matches!(
            store.reserve_on_node("node-1", "s1", &limits).unwrap(),
            ReserveOutcome::Reserved(_)
        ));
        limits.memory_mb = 3144;
        limits.cpu_pct = 100;
        assert!(matches!(
            store.reserve_on_node("node-1", "s2", &limits).unwrap(),
            ReserveOutcome::Reserved(_)
        ));
        limits.memory_mb = 1;
        assert_eq!(
            store.reserve_on_node("node-1", "s3", &limits).unwrap(),
            ReserveOutcome::InsufficientMemory { available_mb: 0 }
        );
    }

    #[test]
    fn reserve_rejects_cpu_overcommit() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1")).unwrap();
        store.put_allocation(&test_allocation("node-1", 25565)).unwrap();

        let mut limits = test_limits();
        limits.memory_mb = 1;
        limits.disk_mb = 1;
        limits.cpu_pct = 500; // node has 400
        assert_eq!(
            store.reserve_on_node("node-1", "s1", &limits).unwrap(),
            ReserveOutcome::InsufficientCpu { available_pct: 400 }
        );
    }

    #[test]
    fn reserve_without_free_allocation() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1")).unwrap();
        let mut taken = test_allocation("node-1", 25565);
        taken.server_id = Some("other".to_string());
        store.put_allocation(&taken).unwrap();

        assert_eq!(
            store
                .reserve_on_node("node-1", "s1", &test_limits())
                .unwrap(),
            ReserveOutcome::NoFreeAllocation
        );
        // Counters untouched.
        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 0);
    }

    #[test]
    fn reserve_on_missing_node() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(
            store.reserve_on_node("nope", "s1", &test_limits()).unwrap(),
            ReserveOutcome::NodeMissing
        );
    }

    #[test]
    fn release_returns_capacity_exactly_once() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1")).unwrap();
        store.put_allocation(&test_allocation("node-1", 25565)).unwrap();

        let limits = test_limits();
        let key = match store.reserve_on_node("node-1", "s1", &limits).unwrap() {
            ReserveOutcome::Reserved(alloc) => alloc.table_key(),
            other => panic!("expected Reserved, got {other:?}"),
        };

        assert!(store.release_on_node(&key, &limits).unwrap());
        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 0);
        assert_eq!(node.disk_allocated_mb, 0);
        assert_eq!(node.cpu_allocated_pct, 0);

        // Second release is a no-op.
        assert!(!store.release_on_node(&key, &limits).unwrap());
        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 0);
    }

    #[test]
    fn release_of_unknown_key_is_noop() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(!store
            .release_on_node("node-1:25565:10.0.0.1", &test_limits())
            .unwrap());
    }

    #[test]
    fn concurrent_reserves_never_overcommit() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1")).unwrap();
        for port in 25565..25575u16 {
            store.put_allocation(&test_allocation("node-1", port)).unwrap();
        }

        // 4096 MB node, ten threads each asking for 1024: at most four win.
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let limits = ResourceLimits {
                    memory_mb: 1024,
                    swap_mb: 2048,
                    disk_mb: 100,
                    cpu_pct: 10,
                    io_weight: 500,
                };
                store
                    .reserve_on_node("node-1", &format!("s{i}"), &limits)
                    .unwrap()
            }));
        }

        let outcomes: Vec<ReserveOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = outcomes
            .iter()
            .filter(|o| matches!(o, ReserveOutcome::Reserved(_)))
            .count();
        assert_eq!(wins, 4);

        let node = store.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.memory_allocated_mb, 4096);
        assert!(node.memory_allocated_mb <= node.memory_total_mb);

        // Each winner got a distinct allocation.
        let bound: Vec<u16> = store
            .list_allocations_for_node("node-1")
            .unwrap()
            .into_iter()
            .filter(|a| a.server_id.is_some())
            .map(|a| a.port)
            .collect();
        assert_eq!(bound.len(), 4);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_node(&test_node("node-1")).unwrap();
            store.put_server(&test_server("s1", "node-1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_node("node-1").unwrap().is_some());
        assert_eq!(store.get_server("s1").unwrap().unwrap().node_id, "node-1");
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_servers().unwrap().is_empty());
        assert!(store.list_locations().unwrap().is_empty());
        assert!(store.list_allocations_for_node("any").unwrap().is_empty());
        assert!(store.list_backups_for_server("any").unwrap().is_empty());
        assert!(!store.delete_node("nope").unwrap());
        assert!(!store.delete_server("nope").unwrap());
        assert!(!store.delete_allocation("nope").unwrap());
    }
}
