//! Agent configuration file.
//!
//! The panel issues this document when a node is provisioned; the operator
//! drops it on the node as JSON and the agent reads it on every start.

use std::path::Path;

use serde::Deserialize;

use crate::error::AgentResult;

fn default_listen_port() -> u16 {
    8080
}

fn default_data_dir() -> String {
    "/var/lib/gantry/volumes".to_string()
}

fn default_backup_dir() -> String {
    "/var/lib/gantry/backups".to_string()
}

fn default_engine_socket() -> String {
    crate::engine::DEFAULT_SOCKET.to_string()
}

fn default_stop_timeout_secs() -> u32 {
    30
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_metrics_interval_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Node-local agent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Id of the node this agent serves, as assigned by the panel.
    pub node_id: String,
    /// Shared secret for panel/agent authentication.
    pub token: String,
    /// Panel base URL, e.g. `https://panel.example.com`.
    pub panel_url: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default = "default_engine_socket")]
    pub engine_socket: String,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u32,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl AgentConfig {
    pub async fn from_file(path: &Path) -> AgentResult<Self> {
        let raw = tokio::fs::read(path).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| crate::error::AgentError::Io(format!("bad config: {e}")))
    }
}
