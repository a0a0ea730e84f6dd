//! HTTP client for the container engine's API over its Unix socket.
//!
//! Speaks the engine's REST API directly with a per-request connection,
//! which keeps the client free of connection-pool state and makes every
//! call cancellable by dropping the future.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use tracing::debug;

use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerState, EngineInfo, RawStats, RuntimeError,
};

/// Default engine socket path.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Container engine client over a Unix socket.
pub struct EngineClient {
    socket_path: PathBuf,
    request_timeout: Duration,
}

impl EngineClient {
    pub fn new(socket_path: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            request_timeout,
        }
    }

    /// One request/response round trip on a fresh socket connection.
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(u16, bytes::Bytes), RuntimeError> {
        let timeout = self.request_timeout;
        let socket = self.socket_path.clone();
        let path = path.to_string();
        let method = method.to_string();

        let result = tokio::time::timeout(timeout, async move {
            let stream = tokio::net::UnixStream::connect(&socket)
                .await
                .map_err(|e| RuntimeError::Connect(e.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| RuntimeError::Connect(e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let payload = match &body {
                Some(value) => bytes::Bytes::from(
                    serde_json::to_vec(value).map_err(|e| RuntimeError::Decode(e.to_string()))?,
                ),
                None => bytes::Bytes::new(),
            };

            let req = http::Request::builder()
                .method(method.as_str())
                .uri(&path)
                .header("host", "localhost")
                .header("content-type", "application/json")
                .body(http_body_util::Full::new(payload))
                .map_err(|e| RuntimeError::Request(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| RuntimeError::Request(e.to_string()))?;

            let status = resp.status().as_u16();
            let raw = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| RuntimeError::Request(e.to_string()))?
                .to_bytes();
            Ok((status, raw))
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(RuntimeError::Timeout(timeout)),
        }
    }

    /// Request that must answer one of `expect`; engine errors are decoded
    /// from the body's `message` field.
    async fn expect_status(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
        expect: &[u16],
    ) -> Result<bytes::Bytes, RuntimeError> {
        let (status, raw) = self.request(method, path, body).await?;
        if expect.contains(&status) {
            return Ok(raw);
        }
        if status == 404 {
            return Err(RuntimeError::NotFound(path.to_string()));
        }
        Err(RuntimeError::Engine {
            status,
            message: engine_message(&raw),
        })
    }

    async fn request_json(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
        expect: &[u16],
    ) -> Result<serde_json::Value, RuntimeError> {
        let raw = self.expect_status(method, path, body, expect).await?;
        serde_json::from_slice(&raw).map_err(|e| RuntimeError::Decode(e.to_string()))
    }
}

/// Pull the `message` field out of an engine error body.
fn engine_message(raw: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(raw).into_owned())
}

/// Minimal percent-encoding for values embedded in query strings.
fn query_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Split `name:tag` into its parts, defaulting the tag to `latest`.
/// Registry ports (`host:5000/img`) are not mistaken for tags.
fn split_image(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(idx) if !image[idx + 1..].contains('/') => (&image[..idx], &image[idx + 1..]),
        _ => (image, "latest"),
    }
}

/// Build the engine's container-create payload from a spec.
fn create_payload(spec: &ContainerSpec) -> serde_json::Value {
    let binds: Vec<String> = spec
        .binds
        .iter()
        .map(|b| {
            let mode = if b.read_only { "ro" } else { "rw" };
            format!("{}:{}:{mode}", b.host_path, b.container_path)
        })
        .collect();

    let mut exposed = serde_json::Map::new();
    let mut port_bindings = serde_json::Map::new();
    for p in &spec.ports {
        let key = format!("{}/{}", p.container_port, p.protocol);
        exposed.insert(key.clone(), serde_json::json!({}));
        port_bindings.insert(
            key,
            serde_json::json!([{ "HostIp": p.host_ip, "HostPort": p.host_port.to_string() }]),
        );
    }

    serde_json::json!({
        "Image": spec.image,
        "Cmd": spec.cmd,
        "Env": spec.env,
        "WorkingDir": spec.working_dir,
        "Labels": spec.labels,
        "ExposedPorts": exposed,
        "StopTimeout": spec.stop_timeout_secs,
        "HostConfig": {
            "Binds": binds,
            "PortBindings": port_bindings,
            "Memory": spec.memory_bytes,
            "MemorySwap": spec.memory_swap_bytes,
            "CpuQuota": spec.cpu_quota,
            "CpuPeriod": spec.cpu_period,
            "BlkioWeight": spec.io_weight,
        }
    })
}

/// Derive usage numbers from one engine stats sample.
fn parse_stats(v: &serde_json::Value) -> RawStats {
    let cpu_total = v["cpu_stats"]["cpu_usage"]["total_usage"].as_u64().unwrap_or(0);
    let pre_cpu_total = v["precpu_stats"]["cpu_usage"]["total_usage"].as_u64().unwrap_or(0);
    let system = v["cpu_stats"]["system_cpu_usage"].as_u64().unwrap_or(0);
    let pre_system = v["precpu_stats"]["system_cpu_usage"].as_u64().unwrap_or(0);
    let online_cpus = v["cpu_stats"]["online_cpus"].as_u64().unwrap_or(1).max(1);

    let cpu_delta = cpu_total.saturating_sub(pre_cpu_total) as f64;
    let system_delta = system.saturating_sub(pre_system) as f64;
    let cpu_percent = if system_delta > 0.0 {
        (cpu_delta / system_delta) * online_cpus as f64 * 100.0
    } else {
        0.0
    };

    let mut rx = 0u64;
    let mut tx = 0u64;
    if let Some(networks) = v["networks"].as_object() {
        for iface in networks.values() {
            rx += iface["rx_bytes"].as_u64().unwrap_or(0);
            tx += iface["tx_bytes"].as_u64().unwrap_or(0);
        }
    }

    RawStats {
        cpu_percent,
        memory_used_bytes: v["memory_stats"]["usage"].as_u64().unwrap_or(0),
        memory_limit_bytes: v["memory_stats"]["limit"].as_u64().unwrap_or(0),
        network_rx_bytes: rx,
        network_tx_bytes: tx,
    }
}

#[async_trait]
impl ContainerRuntime for EngineClient {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.expect_status("GET", "/_ping", None, &[200]).await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let path = format!("/images/{}/json", query_encode(image));
        match self.request("GET", &path, None).await? {
            (200, _) => Ok(true),
            (404, _) => Ok(false),
            (status, raw) => Err(RuntimeError::Engine {
                status,
                message: engine_message(&raw),
            }),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (name, tag) = split_image(image);
        let path = format!(
            "/images/create?fromImage={}&tag={}",
            query_encode(name),
            query_encode(tag)
        );
        // The engine streams progress; collecting the body waits for the
        // pull to finish.
        self.expect_status("POST", &path, None, &[200]).await?;
        debug!(%image, "image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let path = format!("/containers/create?name={}", query_encode(&spec.name));
        let value = self
            .request_json("POST", &path, Some(create_payload(spec)), &[201])
            .await?;
        value["Id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RuntimeError::Decode("missing container Id".to_string()))
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        // 304: already started.
        self.expect_status("POST", &format!("/containers/{id}/start"), None, &[204, 304])
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), RuntimeError> {
        self.expect_status(
            "POST",
            &format!("/containers/{id}/stop?t={timeout_secs}"),
            None,
            &[204, 304],
        )
        .await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        // 409: not running, which is what kill wants anyway.
        self.expect_status("POST", &format!("/containers/{id}/kill"), None, &[204, 409])
            .await?;
        Ok(())
    }

    async fn restart_container(&self, id: &str, timeout_secs: u32) -> Result<(), RuntimeError> {
        self.expect_status(
            "POST",
            &format!("/containers/{id}/restart?t={timeout_secs}"),
            None,
            &[204],
        )
        .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let path = format!("/containers/{id}?force={force}&v=true");
        match self.request("DELETE", &path, None).await? {
            (204, _) | (404, _) => Ok(()), // already gone is fine
            (status, raw) => Err(RuntimeError::Engine {
                status,
                message: engine_message(&raw),
            }),
        }
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<(), RuntimeError> {
        let body = serde_json::json!({
            "Cmd": cmd,
            "AttachStdout": false,
            "AttachStderr": false,
        });
        let value = self
            .request_json("POST", &format!("/containers/{id}/exec"), Some(body), &[201])
            .await?;
        let exec_id = value["Id"]
            .as_str()
            .ok_or_else(|| RuntimeError::Decode("missing exec Id".to_string()))?;

        self.expect_status(
            "POST",
            &format!("/exec/{exec_id}/start"),
            Some(serde_json::json!({ "Detach": true })),
            &[200],
        )
        .await?;
        Ok(())
    }

    async fn container_state(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let value = self
            .request_json("GET", &format!("/containers/{id}/json"), None, &[200])
            .await?;
        let status = value["State"]["Status"]
            .as_str()
            .ok_or_else(|| RuntimeError::Decode("missing State.Status".to_string()))?;
        ContainerState::parse(status)
            .ok_or_else(|| RuntimeError::Decode(format!("unknown container state {status}")))
    }

    async fn container_stats(&self, id: &str) -> Result<RawStats, RuntimeError> {
        let value = self
            .request_json(
                "GET",
                &format!("/containers/{id}/stats?stream=false&one-shot=false"),
                None,
                &[200],
            )
            .await?;
        Ok(parse_stats(&value))
    }

    async fn list_by_label(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<(String, HashMap<String, String>)>, RuntimeError> {
        let filters = serde_json::json!({ "label": [format!("{label}={value}")] }).to_string();
        let path = format!("/containers/json?all=true&filters={}", query_encode(&filters));
        let listed = self.request_json("GET", &path, None, &[200]).await?;

        let mut results = Vec::new();
        if let Some(entries) = listed.as_array() {
            for entry in entries {
                let id = entry["Id"].as_str().unwrap_or_default().to_string();
                let labels: HashMap<String, String> = entry["Labels"]
                    .as_object()
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| {
                                v.as_str().map(|s| (k.clone(), s.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                results.push((id, labels));
            }
        }
        Ok(results)
    }

    async fn info(&self) -> Result<EngineInfo, RuntimeError> {
        let value = self.request_json("GET", "/info", None, &[200]).await?;
        Ok(EngineInfo {
            version: value["ServerVersion"].as_str().unwrap_or("unknown").to_string(),
            kernel: value["KernelVersion"].as_str().unwrap_or("unknown").to_string(),
            os: value["OperatingSystem"].as_str().unwrap_or("unknown").to_string(),
            cpu_cores: value["NCPU"].as_u64().unwrap_or(0) as u32,
            memory_mb: value["MemTotal"].as_u64().unwrap_or(0) / (1024 * 1024),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Bind, PortBinding};

    #[test]
    fn image_name_splitting() {
        assert_eq!(split_image("nginx"), ("nginx", "latest"));
        assert_eq!(split_image("nginx:1.25"), ("nginx", "1.25"));
        assert_eq!(
            split_image("ghcr.io/example/minecraft:java17"),
            ("ghcr.io/example/minecraft", "java17")
        );
        // A registry port is not a tag.
        assert_eq!(
            split_image("registry.local:5000/game"),
            ("registry.local:5000/game", "latest")
        );
    }

    #[test]
    fn query_encoding() {
        assert_eq!(query_encode("abc-123"), "abc-123");
        assert_eq!(query_encode("a b"), "a%20b");
        assert_eq!(query_encode(r#"{"label":["x=y"]}"#), "%7B%22label%22%3A%5B%22x%3Dy%22%5D%7D");
    }

    #[test]
    fn create_payload_shape() {
        let spec = ContainerSpec {
            name: "gantry-aabbccdd".to_string(),
            image: "img:1".to_string(),
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), "run".to_string()],
            env: vec!["A=1".to_string()],
            working_dir: "/home/container".to_string(),
            labels: [("gantry.managed".to_string(), "true".to_string())].into(),
            binds: vec![Bind {
                host_path: "/data/s1".to_string(),
                container_path: "/home/container".to_string(),
                read_only: false,
            }],
            ports: vec![PortBinding {
                host_ip: "10.0.0.1".to_string(),
                host_port: 25565,
                container_port: 25565,
                protocol: "tcp".to_string(),
            }],
            memory_bytes: 1024 * 1024 * 1024,
            memory_swap_bytes: 3 * 1024 * 1024 * 1024,
            cpu_quota: 200_000,
            cpu_period: 100_000,
            io_weight: 500,
            stop_timeout_secs: 30,
        };

        let payload = create_payload(&spec);
        assert_eq!(payload["HostConfig"]["Binds"][0], "/data/s1:/home/container:rw");
        assert_eq!(
            payload["HostConfig"]["PortBindings"]["25565/tcp"][0]["HostPort"],
            "25565"
        );
        assert_eq!(payload["HostConfig"]["CpuQuota"], 200_000);
        assert_eq!(payload["HostConfig"]["BlkioWeight"], 500);
        assert_eq!(payload["ExposedPorts"]["25565/tcp"], serde_json::json!({}));
    }

    #[test]
    fn stats_parsing_computes_cpu_percent() {
        let sample = serde_json::json!({
            "cpu_stats": {
                "cpu_usage": { "total_usage": 2_000_000u64 },
                "system_cpu_usage": 20_000_000u64,
                "online_cpus": 4
            },
            "precpu_stats": {
                "cpu_usage": { "total_usage": 1_000_000u64 },
                "system_cpu_usage": 10_000_000u64
            },
            "memory_stats": { "usage": 512u64, "limit": 1024u64 },
            "networks": {
                "eth0": { "rx_bytes": 100u64, "tx_bytes": 200u64 },
                "eth1": { "rx_bytes": 10u64, "tx_bytes": 20u64 }
            }
        });

        let stats = parse_stats(&sample);
        // delta 1M over system delta 10M across 4 cpus = 40%.
        assert!((stats.cpu_percent - 40.0).abs() < f64::EPSILON);
        assert_eq!(stats.memory_used_bytes, 512);
        assert_eq!(stats.memory_limit_bytes, 1024);
        assert_eq!(stats.network_rx_bytes, 110);
        assert_eq!(stats.network_tx_bytes, 220);
    }

    #[test]
    fn stats_parsing_handles_missing_fields() {
        let stats = parse_stats(&serde_json::json!({}));
        assert_eq!(stats.cpu_percent, 0.0);
        assert_eq!(stats.memory_used_bytes, 0);
    }

    #[test]
    fn engine_error_message_extraction() {
        assert_eq!(
            engine_message(br#"{"message":"no such image"}"#),
            "no such image"
        );
        assert_eq!(engine_message(b"plain text"), "plain text");
    }
}
