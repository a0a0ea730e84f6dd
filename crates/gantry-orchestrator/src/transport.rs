//! Node transport — how the panel talks to agents.
//!
//! Every remote effect the orchestrator needs goes through the
//! [`NodeTransport`] trait, so lifecycle logic can be tested against a fake
//! and the wire protocol lives in one place. The concrete implementation
//! speaks JSON over HTTP/1 to the agent's API, authenticated with the
//! node's daemon token.

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use thiserror::Error;
use tracing::debug;

use gantry_state::{Node, ServerSpec, ServerStats};

/// Errors from talking to a node agent.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("node returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Decode(String),
}

/// Remote operations the panel performs against a node agent.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Materialize a server's container. Returns the container id.
    async fn create_server(&self, node: &Node, spec: &ServerSpec)
    -> Result<String, TransportError>;

    async fn start_server(&self, node: &Node, server_id: &str) -> Result<(), TransportError>;

    async fn stop_server(&self, node: &Node, server_id: &str) -> Result<(), TransportError>;

    async fn restart_server(&self, node: &Node, server_id: &str) -> Result<(), TransportError>;

    async fn kill_server(&self, node: &Node, server_id: &str) -> Result<(), TransportError>;

    async fn send_command(
        &self,
        node: &Node,
        server_id: &str,
        command: &str,
    ) -> Result<(), TransportError>;

    async fn create_backup(
        &self,
        node: &Node,
        server_id: &str,
        backup_id: &str,
        name: &str,
    ) -> Result<(), TransportError>;

    /// Tear down and re-create the server's container from its spec.
    async fn reinstall_server(
        &self,
        node: &Node,
        spec: &ServerSpec,
    ) -> Result<(), TransportError>;

    async fn delete_server(&self, node: &Node, server_id: &str) -> Result<(), TransportError>;

    async fn fetch_stats(
        &self,
        node: &Node,
        server_id: &str,
    ) -> Result<ServerStats, TransportError>;
}

/// HTTP/1 transport against the agent API.
pub struct HttpNodeTransport {
    request_timeout: Duration,
}

impl HttpNodeTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// One request/response round trip to a node, bearer-authenticated.
    async fn request(
        &self,
        node: &Node,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError> {
        let address = format!("{}:{}", node.fqdn, node.daemon_port);
        let uri = format!("http://{address}{path}");
        let timeout = self.request_timeout;

        let result = tokio::time::timeout(timeout, async {
            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|e| TransportError::Connect(address.clone(), e.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| TransportError::Connect(address.clone(), e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let payload = match &body {
                Some(value) => bytes::Bytes::from(
                    serde_json::to_vec(value).map_err(|e| TransportError::Decode(e.to_string()))?,
                ),
                None => bytes::Bytes::new(),
            };

            let req = http::Request::builder()
                .method(method)
                .uri(&uri)
                .header("host", &address)
                .header("authorization", format!("Bearer {}", node.daemon_token))
                .header("content-type", "application/json")
                .header("user-agent", "gantry-panel/0.1")
                .body(http_body_util::Full::new(payload))
                .map_err(|e| TransportError::Request(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| TransportError::Request(e.to_string()))?;

            let status = resp.status();
            let collected = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| TransportError::Request(e.to_string()))?;
            let raw = collected.to_bytes();

            if !status.is_success() {
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&raw).into_owned(),
                });
            }

            parse_envelope(&raw)
        })
        .await;

        match result {
            Ok(inner) => {
                debug!(node_id = %node.id, %method, %path, "node request completed");
                inner
            }
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

/// Extract the `data` member from an agent response envelope.
///
/// Agents answer `{"success": bool, "data": ..., "error": ...}`; an empty
/// body is treated as null data (some power endpoints return nothing).
fn parse_envelope(raw: &[u8]) -> Result<serde_json::Value, TransportError> {
    if raw.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| TransportError::Decode(e.to_string()))?;
    if value.get("success").and_then(|v| v.as_bool()) == Some(false) {
        let msg = value
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown agent error")
            .to_string();
        return Err(TransportError::Request(msg));
    }
    Ok(value.get("data").cloned().unwrap_or(serde_json::Value::Null))
}

#[async_trait]
impl NodeTransport for HttpNodeTransport {
    async fn create_server(
        &self,
        node: &Node,
        spec: &ServerSpec,
    ) -> Result<String, TransportError> {
        let body = serde_json::to_value(spec).map_err(|e| TransportError::Decode(e.to_string()))?;
        let data = self
            .request(node, "POST", "/api/servers", Some(body))
            .await?;
        data.get("container_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| TransportError::Decode("missing container_id".to_string()))
    }

    async fn start_server(&self, node: &Node, server_id: &str) -> Result<(), TransportError> {
        self.request(node, "POST", &format!("/api/servers/{server_id}/power/start"), None)
            .await
            .map(|_| ())
    }

    async fn stop_server(&self, node: &Node, server_id: &str) -> Result<(), TransportError> {
        self.request(node, "POST", &format!("/api/servers/{server_id}/power/stop"), None)
            .await
            .map(|_| ())
    }

    async fn restart_server(&self, node: &Node, server_id: &str) -> Result<(), TransportError> {
        self.request(node, "POST", &format!("/api/servers/{server_id}/power/restart"), None)
            .await
            .map(|_| ())
    }

    async fn kill_server(&self, node: &Node, server_id: &str) -> Result<(), TransportError> {
        self.request(node, "POST", &format!("/api/servers/{server_id}/power/kill"), None)
            .await
            .map(|_| ())
    }

    async fn send_command(
        &self,
        node: &Node,
        server_id: &str,
        command: &str,
    ) -> Result<(), TransportError> {
        let body = serde_json::json!({ "command": command });
        self.request(
            node,
            "POST",
            &format!("/api/servers/{server_id}/command"),
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn create_backup(
        &self,
        node: &Node,
        server_id: &str,
        backup_id: &str,
        name: &str,
    ) -> Result<(), TransportError> {
        let body = serde_json::json!({ "backup_id": backup_id, "name": name });
        self.request(
            node,
            "POST",
            &format!("/api/servers/{server_id}/backup"),
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn reinstall_server(
        &self,
        node: &Node,
        spec: &ServerSpec,
    ) -> Result<(), TransportError> {
        let body = serde_json::to_value(spec).map_err(|e| TransportError::Decode(e.to_string()))?;
        self.request(
            node,
            "POST",
            &format!("/api/servers/{}/reinstall", spec.server_id),
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn delete_server(&self, node: &Node, server_id: &str) -> Result<(), TransportError> {
        self.request(node, "DELETE", &format!("/api/servers/{server_id}"), None)
            .await
            .map(|_| ())
    }

    async fn fetch_stats(
        &self,
        node: &Node,
        server_id: &str,
    ) -> Result<ServerStats, TransportError> {
        let data = self
            .request(node, "GET", &format!("/api/servers/{server_id}/stats"), None)
            .await?;
        serde_json::from_value(data).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Transport that succeeds unconditionally and talks to nobody.
///
/// Useful for tests and for running the panel without any provisioned
/// agents.
pub struct NoopTransport;

#[async_trait]
impl NodeTransport for NoopTransport {
    async fn create_server(
        &self,
        _node: &Node,
        spec: &ServerSpec,
    ) -> Result<String, TransportError> {
        Ok(format!("noop-{}", spec.short_id))
    }

    async fn start_server(&self, _node: &Node, _server_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn stop_server(&self, _node: &Node, _server_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn restart_server(&self, _node: &Node, _server_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn kill_server(&self, _node: &Node, _server_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_command(
        &self,
        _node: &Node,
        _server_id: &str,
        _command: &str,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn create_backup(
        &self,
        _node: &Node,
        _server_id: &str,
        _backup_id: &str,
        _name: &str,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn reinstall_server(
        &self,
        _node: &Node,
        _spec: &ServerSpec,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn delete_server(&self, _node: &Node, _server_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn fetch_stats(
        &self,
        _node: &Node,
        _server_id: &str,
    ) -> Result<ServerStats, TransportError> {
        Ok(ServerStats::default())
    }
}
