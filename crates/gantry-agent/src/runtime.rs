//! Container runtime abstraction.
//!
//! Everything the supervisor needs from the container engine, expressed as
//! a trait so tests can run against an in-memory fake. The real
//! implementation is [`EngineClient`](crate::engine::EngineClient).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the container engine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("engine connect failed: {0}")]
    Connect(String),

    #[error("engine request failed: {0}")]
    Request(String),

    #[error("engine returned {status}: {message}")]
    Engine { status: u16, message: String },

    #[error("malformed engine response: {0}")]
    Decode(String),

    #[error("engine request timed out after {0:?}")]
    Timeout(Duration),

    #[error("container not found: {0}")]
    NotFound(String),
}

/// Engine-reported container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
}

impl ContainerState {
    /// Parse the engine's state string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ContainerState::Created),
            "running" => Some(ContainerState::Running),
            "paused" => Some(ContainerState::Paused),
            "restarting" => Some(ContainerState::Restarting),
            "exited" => Some(ContainerState::Exited),
            "dead" => Some(ContainerState::Dead),
            _ => None,
        }
    }
}

/// A host directory mounted into the container.
#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// One published port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    /// "tcp" or "udp".
    pub protocol: String,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub working_dir: String,
    pub labels: HashMap<String, String>,
    pub binds: Vec<Bind>,
    pub ports: Vec<PortBinding>,
    pub memory_bytes: u64,
    /// Memory plus swap, the engine's combined ceiling.
    pub memory_swap_bytes: u64,
    /// CPU quota in microseconds per period.
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub io_weight: u16,
    pub stop_timeout_secs: u32,
}

/// Raw usage counters scraped from the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawStats {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// Node-level facts reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineInfo {
    pub version: String,
    pub kernel: String,
    pub os: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

/// Operations the supervisor performs against the container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verify the engine is reachable.
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container. Returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Graceful stop, escalating to SIGKILL after `timeout_secs`.
    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), RuntimeError>;

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn restart_container(&self, id: &str, timeout_secs: u32) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Run a command inside the container, detached.
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<(), RuntimeError>;

    async fn container_state(&self, id: &str) -> Result<ContainerState, RuntimeError>;

    async fn container_stats(&self, id: &str) -> Result<RawStats, RuntimeError>;

    /// Containers carrying `label=value`, with their labels.
    async fn list_by_label(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<(String, HashMap<String, String>)>, RuntimeError>;

    async fn info(&self) -> Result<EngineInfo, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parsing() {
        assert_eq!(ContainerState::parse("running"), Some(ContainerState::Running));
        assert_eq!(ContainerState::parse("exited"), Some(ContainerState::Exited));
        assert_eq!(ContainerState::parse("weird"), None);
    }
}
