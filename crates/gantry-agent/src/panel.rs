//! Client for the calls the agent makes back to the panel.
//!
//! The agent announces itself on boot and reports install and backup
//! completion. Every call is a short-lived http/1.1 connection
//! authenticated with the node's daemon token.

use std::time::Duration;

use http_body_util::BodyExt;
use tracing::debug;

use crate::error::{AgentError, AgentResult};

/// Panel-side HTTP client.
pub struct PanelClient {
    host: String,
    port: u16,
    node_id: String,
    token: String,
    request_timeout: Duration,
}

/// Split a panel URL into host and port, defaulting the port by scheme.
fn parse_base_url(url: &str) -> Option<(String, u16)> {
    let (scheme, rest) = url.split_once("://")?;
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let authority = rest.split('/').next()?;
    match authority.split_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), default_port)),
    }
}

impl PanelClient {
    pub fn new(
        panel_url: &str,
        node_id: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> AgentResult<Self> {
        let (host, port) = parse_base_url(panel_url)
            .ok_or_else(|| AgentError::Io(format!("bad panel url: {panel_url}")))?;
        Ok(Self {
            host,
            port,
            node_id: node_id.into(),
            token: token.into(),
            request_timeout,
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> AgentResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let timeout = self.request_timeout;
        let token = self.token.clone();
        let path = path.to_string();

        let result = tokio::time::timeout(timeout, async move {
            let stream = tokio::net::TcpStream::connect(&addr)
                .await
                .map_err(|e| AgentError::Io(format!("panel connect {addr}: {e}")))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| AgentError::Io(format!("panel handshake: {e}")))?;
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let payload = serde_json::to_vec(&body)
                .map_err(|e| AgentError::Io(e.to_string()))?;
            let req = http::Request::builder()
                .method("POST")
                .uri(&path)
                .header("host", &addr)
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(http_body_util::Full::new(bytes::Bytes::from(payload)))
                .map_err(|e| AgentError::Io(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| AgentError::Io(format!("panel request: {e}")))?;
            let status = resp.status();
            if !status.is_success() {
                let raw = resp
                    .into_body()
                    .collect()
                    .await
                    .map(|b| b.to_bytes())
                    .unwrap_or_default();
                return Err(AgentError::Io(format!(
                    "panel returned {}: {}",
                    status.as_u16(),
                    String::from_utf8_lossy(&raw)
                )));
            }
            Ok(())
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AgentError::Io(format!(
                "panel request timed out after {timeout:?}"
            ))),
        }
    }

    async fn get(&self, path: &str) -> AgentResult<serde_json::Value> {
        let addr = format!("{}:{}", self.host, self.port);
        let timeout = self.request_timeout;
        let token = self.token.clone();
        let path = path.to_string();

        let result = tokio::time::timeout(timeout, async move {
            let stream = tokio::net::TcpStream::connect(&addr)
                .await
                .map_err(|e| AgentError::Io(format!("panel connect {addr}: {e}")))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| AgentError::Io(format!("panel handshake: {e}")))?;
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method("GET")
                .uri(&path)
                .header("host", &addr)
                .header("authorization", format!("Bearer {token}"))
                .body(http_body_util::Full::new(bytes::Bytes::new()))
                .map_err(|e| AgentError::Io(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| AgentError::Io(format!("panel request: {e}")))?;
            let status = resp.status();
            let raw = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| AgentError::Io(e.to_string()))?
                .to_bytes();
            if !status.is_success() {
                return Err(AgentError::Io(format!(
                    "panel returned {}: {}",
                    status.as_u16(),
                    String::from_utf8_lossy(&raw)
                )));
            }
            let value: serde_json::Value = serde_json::from_slice(&raw)
                .map_err(|e| AgentError::Io(format!("bad panel response: {e}")))?;
            Ok(value.get("data").cloned().unwrap_or(serde_json::Value::Null))
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AgentError::Io(format!(
                "panel request timed out after {timeout:?}"
            ))),
        }
    }

    /// The node's configuration document, as the panel currently issues it.
    pub async fn fetch_configuration(&self) -> AgentResult<serde_json::Value> {
        self.get(&format!("/api/v1/nodes/{}/configuration", self.node_id))
            .await
    }

    /// Specs for every server assigned to this node, for adoption on boot.
    pub async fn fetch_servers(&self) -> AgentResult<Vec<gantry_state::ServerSpec>> {
        let data = self
            .get(&format!("/api/v1/nodes/{}/servers", self.node_id))
            .await?;
        serde_json::from_value(data).map_err(|e| AgentError::Io(format!("bad server specs: {e}")))
    }

    /// Announce this agent to the panel, proving possession of the token.
    pub async fn announce(&self, listen_port: u16) -> AgentResult<()> {
        debug!(node_id = %self.node_id, "announcing to panel");
        self.post(
            &format!("/api/v1/nodes/{}/register", self.node_id),
            serde_json::json!({
                "node_id": self.node_id,
                "token": self.token,
                "listen_port": listen_port,
            }),
        )
        .await
    }

    /// Tell the panel a server finished installing.
    pub async fn notify_installed(&self, server_id: &str) -> AgentResult<()> {
        self.post(
            &format!("/api/v1/servers/{server_id}/installed"),
            serde_json::json!({}),
        )
        .await
    }

    /// Report a finished backup.
    pub async fn notify_backup_completed(
        &self,
        server_id: &str,
        backup_id: &str,
        checksum: &str,
        size_bytes: u64,
    ) -> AgentResult<()> {
        self.post(
            &format!("/api/v1/servers/{server_id}/backups/{backup_id}/completed"),
            serde_json::json!({ "checksum": checksum, "size_bytes": size_bytes }),
        )
        .await
    }

    /// Report a failed backup.
    pub async fn notify_backup_failed(
        &self,
        server_id: &str,
        backup_id: &str,
        error: &str,
    ) -> AgentResult<()> {
        self.post(
            &format!("/api/v1/servers/{server_id}/backups/{backup_id}/failed"),
            serde_json::json!({ "error": error }),
        )
        .await
    }
}
