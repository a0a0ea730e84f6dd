//! First-fit placement over the inventory store.

use tracing::{debug, info};

use gantry_state::{Allocation, ReserveOutcome, ResourceLimits, StateStore};

use crate::error::{PlacementError, PlacementResult};

/// Reserves and releases node capacity for servers.
///
/// The actual check-bind-bump sequence runs inside a single store
/// transaction; the engine adds the placement policy on top (drained nodes
/// receive nothing) and maps outcomes onto the error taxonomy.
#[derive(Clone)]
pub struct PlacementEngine {
    state: StateStore,
}

impl PlacementEngine {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Reserve capacity and a port allocation for a server on a node.
    ///
    /// Returns the allocation that was bound. On any failure nothing is
    /// written, so a rejected placement needs no cleanup.
    pub fn reserve(
        &self,
        node_id: &str,
        server_id: &str,
        limits: &ResourceLimits,
    ) -> PlacementResult<Allocation> {
        let node = self
            .state
            .get_node(node_id)?
            .ok_or_else(|| PlacementError::NodeNotFound(node_id.to_string()))?;

        if node.maintenance_mode {
            return Err(PlacementError::NodeUnavailable(format!(
                "node {node_id} is in maintenance mode"
            )));
        }

        match self.state.reserve_on_node(node_id, server_id, limits)? {
            ReserveOutcome::Reserved(alloc) => {
                info!(
                    %node_id,
                    %server_id,
                    port = alloc.port,
                    memory_mb = limits.memory_mb,
                    disk_mb = limits.disk_mb,
                    cpu_pct = limits.cpu_pct,
                    "capacity reserved"
                );
                Ok(alloc)
            }
            ReserveOutcome::NodeMissing => {
                // Deleted between the policy read and the transaction.
                Err(PlacementError::NodeNotFound(node_id.to_string()))
            }
            ReserveOutcome::InsufficientMemory { available_mb } => {
                Err(PlacementError::ResourceExhausted(format!(
                    "node {node_id} has {available_mb} MB memory available, {} MB requested",
                    limits.memory_mb
                )))
            }
            ReserveOutcome::InsufficientDisk { available_mb } => {
                Err(PlacementError::ResourceExhausted(format!(
                    "node {node_id} has {available_mb} MB disk available, {} MB requested",
                    limits.disk_mb
                )))
            }
            ReserveOutcome::InsufficientCpu { available_pct } => {
                Err(PlacementError::ResourceExhausted(format!(
                    "node {node_id} has {available_pct}% cpu available, {}% requested",
                    limits.cpu_pct
                )))
            }
            ReserveOutcome::NoFreeAllocation => {
                Err(PlacementError::NoAvailableAllocation(node_id.to_string()))
            }
        }
    }

    /// Release a reservation made by [`reserve`](Self::reserve).
    ///
    /// Idempotent: releasing an already-released allocation returns `false`
    /// and changes nothing, so delete retries are safe.
    pub fn release(&self, allocation_key: &str, limits: &ResourceLimits) -> PlacementResult<bool> {
        let released = self.state.release_on_node(allocation_key, limits)?;
        debug!(%allocation_key, released, "capacity released");
        Ok(released)
    }
}
