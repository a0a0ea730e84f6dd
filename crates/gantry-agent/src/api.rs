//! Agent HTTP API.
//!
//! The panel drives the agent through these routes, authenticated with the
//! node's daemon token. WebSocket console clients may pass the token as a
//! `?token=` query parameter since browsers can't set headers on upgrade
//! requests.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness, unauthenticated |
//! | POST | `/api/servers` | Create a server container |
//! | GET | `/api/servers/{id}` | Server status snapshot |
//! | DELETE | `/api/servers/{id}` | Tear down a server |
//! | POST | `/api/servers/{id}/power/{action}` | start, stop, restart, kill |
//! | POST | `/api/servers/{id}/command` | Run a console command |
//! | POST | `/api/servers/{id}/backup` | Kick off a backup |
//! | POST | `/api/servers/{id}/reinstall` | Replace the container |
//! | GET | `/api/servers/{id}/stats` | Latest usage sample |
//! | GET | `/api/system` | Engine and host facts |
//! | GET | `/ws/console/{id}` | Console WebSocket |

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use gantry_state::ServerSpec;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::backup;
use crate::console::ConsoleBridge;
use crate::error::AgentError;
use crate::panel::PanelClient;
use crate::supervisor::Supervisor;

/// Shared state for agent API handlers.
#[derive(Clone)]
pub struct AgentApiState {
    pub supervisor: Arc<Supervisor>,
    pub console: Arc<ConsoleBridge>,
    /// Present when the agent knows its panel; callbacks are skipped
    /// otherwise.
    pub panel: Option<Arc<PanelClient>>,
    pub token: String,
    pub backup_root: PathBuf,
}

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn agent_error_response(err: &AgentError) -> axum::response::Response {
    let status = match err {
        AgentError::NotFound(_) => StatusCode::NOT_FOUND,
        AgentError::Conflict(_) => StatusCode::CONFLICT,
        AgentError::Io(_) | AgentError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&err.to_string(), status).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn require_token(
    State(state): State<AgentApiState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> axum::response::Response {
    match bearer_token(&headers) {
        Some(token) if token == state.token => next.run(request).await,
        _ => error_response("invalid or missing token", StatusCode::UNAUTHORIZED).into_response(),
    }
}

/// Build the agent router.
pub fn build_router(state: AgentApiState) -> Router {
    let api_routes = Router::new()
        .route("/servers", post(create_server))
        .route("/servers/{id}", get(get_server).delete(delete_server))
        .route("/servers/{id}/power/{action}", post(power_action))
        .route("/servers/{id}/command", post(send_command))
        .route("/servers/{id}/backup", post(create_backup))
        .route("/servers/{id}/reinstall", post(reinstall_server))
        .route("/servers/{id}/stats", get(server_stats))
        .route("/system", get(system_info))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .route("/ws/console/{id}", get(console_ws).with_state(state.clone()))
        .nest("/api", api_routes)
}

// ── Liveness ───────────────────────────────────────────────────

/// GET /health
pub async fn health() -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({ "status": "ok" }))
}

// ── Servers ────────────────────────────────────────────────────

/// POST /api/servers
pub async fn create_server(
    State(state): State<AgentApiState>,
    Json(spec): Json<ServerSpec>,
) -> impl IntoResponse {
    let server_id = spec.server_id.clone();
    match state.supervisor.create_server(spec).await {
        Ok(container_id) => {
            // Install finished; tell the panel so it can release the
            // server to its owner.
            if let Some(panel) = state.panel.clone() {
                tokio::spawn(async move {
                    if let Err(err) = panel.notify_installed(&server_id).await {
                        warn!(%server_id, %err, "install callback failed");
                    }
                });
            }
            (
                StatusCode::CREATED,
                ApiResponse::ok(serde_json::json!({ "container_id": container_id })),
            )
                .into_response()
        }
        Err(e) => agent_error_response(&e),
    }
}

/// GET /api/servers/{id}
pub async fn get_server(
    State(state): State<AgentApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.entry_snapshot(&id).await {
        Ok(entry) => ApiResponse::ok(serde_json::json!({
            "server_id": entry.spec.server_id,
            "container_id": entry.container_id,
            "status": entry.status,
            "uptime_secs": entry.stats.uptime_secs,
        }))
        .into_response(),
        Err(e) => agent_error_response(&e),
    }
}

/// DELETE /api/servers/{id}
pub async fn delete_server(
    State(state): State<AgentApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.delete_server(&id).await {
        Ok(()) => {
            state.console.remove(&id).await;
            ApiResponse::ok("deleted").into_response()
        }
        Err(e) => agent_error_response(&e),
    }
}

// ── Power ──────────────────────────────────────────────────────

/// POST /api/servers/{id}/power/{action}
pub async fn power_action(
    State(state): State<AgentApiState>,
    Path((id, action)): Path<(String, String)>,
) -> impl IntoResponse {
    let result = match action.as_str() {
        "start" => state.supervisor.start_server(&id).await,
        "stop" => state.supervisor.stop_server(&id).await,
        "restart" => state.supervisor.restart_server(&id).await,
        "kill" => state.supervisor.kill_server(&id).await,
        _ => {
            return error_response(
                &format!("unknown power action: {action}"),
                StatusCode::BAD_REQUEST,
            )
            .into_response();
        }
    };
    match result {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "action": action })).into_response(),
        Err(e) => agent_error_response(&e),
    }
}

// ── Commands ───────────────────────────────────────────────────

/// Command request body.
#[derive(Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

/// POST /api/servers/{id}/command
pub async fn send_command(
    State(state): State<AgentApiState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> impl IntoResponse {
    match state.supervisor.send_command(&id, &req.command).await {
        Ok(()) => {
            state.console.publish(&id, format!("> {}", req.command)).await;
            ApiResponse::ok("sent").into_response()
        }
        Err(e) => agent_error_response(&e),
    }
}

// ── Backups ────────────────────────────────────────────────────

/// Backup request body.
#[derive(Deserialize)]
pub struct BackupRequest {
    pub backup_id: String,
    #[serde(default)]
    pub name: String,
}

/// POST /api/servers/{id}/backup
///
/// Accepted immediately; the copy runs in the background and the outcome
/// reaches the panel through its callback routes.
pub async fn create_backup(
    State(state): State<AgentApiState>,
    Path(id): Path<String>,
    Json(req): Json<BackupRequest>,
) -> impl IntoResponse {
    // Fail fast on unknown servers so the panel gets a synchronous 404.
    if let Err(e) = state.supervisor.entry_snapshot(&id).await {
        return agent_error_response(&e);
    }

    let data_dir = state.supervisor.server_data_dir(&id);
    let backup_root = state.backup_root.clone();
    let panel = state.panel.clone();
    let backup_id = req.backup_id.clone();
    tokio::spawn(async move {
        let result = backup::create_backup(&data_dir, &backup_root, &id, &backup_id).await;
        let Some(panel) = panel else { return };
        let callback = match &result {
            Ok(artifact) => {
                info!(server_id = %id, %backup_id, "backup finished");
                panel
                    .notify_backup_completed(&id, &backup_id, &artifact.checksum, artifact.size_bytes)
                    .await
            }
            Err(err) => {
                error!(server_id = %id, %backup_id, %err, "backup failed");
                panel
                    .notify_backup_failed(&id, &backup_id, &err.to_string())
                    .await
            }
        };
        if let Err(err) = callback {
            warn!(%backup_id, %err, "backup callback failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(serde_json::json!({ "backup_id": req.backup_id, "status": "pending" })),
    )
        .into_response()
}

// ── Reinstall ──────────────────────────────────────────────────

/// POST /api/servers/{id}/reinstall
pub async fn reinstall_server(
    State(state): State<AgentApiState>,
    Path(id): Path<String>,
    Json(spec): Json<ServerSpec>,
) -> impl IntoResponse {
    if spec.server_id != id {
        return error_response("spec id does not match path", StatusCode::BAD_REQUEST)
            .into_response();
    }
    let server_id = spec.server_id.clone();
    match state.supervisor.reinstall_server(spec).await {
        Ok(container_id) => {
            if let Some(panel) = state.panel.clone() {
                tokio::spawn(async move {
                    if let Err(err) = panel.notify_installed(&server_id).await {
                        warn!(%server_id, %err, "install callback failed");
                    }
                });
            }
            ApiResponse::ok(serde_json::json!({ "container_id": container_id })).into_response()
        }
        Err(e) => agent_error_response(&e),
    }
}

// ── Stats ──────────────────────────────────────────────────────

/// GET /api/servers/{id}/stats
pub async fn server_stats(
    State(state): State<AgentApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.server_stats(&id).await {
        Ok(stats) => ApiResponse::ok(stats).into_response(),
        Err(e) => agent_error_response(&e),
    }
}

// ── System ─────────────────────────────────────────────────────

/// GET /api/system
pub async fn system_info(State(state): State<AgentApiState>) -> impl IntoResponse {
    match state.supervisor.system_info().await {
        Ok(info) => ApiResponse::ok(info).into_response(),
        Err(e) => agent_error_response(&e),
    }
}

// ── Console WebSocket ──────────────────────────────────────────

#[derive(Deserialize)]
pub struct ConsoleQuery {
    #[serde(default)]
    token: Option<String>,
}

/// GET /ws/console/{id}
pub async fn console_ws(
    State(state): State<AgentApiState>,
    Path(id): Path<String>,
    Query(query): Query<ConsoleQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let authorized = bearer_token(&headers) == Some(state.token.as_str())
        || query.token.as_deref() == Some(state.token.as_str());
    if !authorized {
        return error_response("invalid or missing token", StatusCode::UNAUTHORIZED)
            .into_response();
    }
    if state.supervisor.entry_snapshot(&id).await.is_err() {
        return error_response("server not found", StatusCode::NOT_FOUND).into_response();
    }

    let console = state.console.clone();
    ws.on_upgrade(move |socket| async move {
        let (output, input) = console.attach(&id).await;
        drive_console(socket, output, input).await;
    })
}

/// Shuttle lines between the socket and the console channels until either
/// side closes.
async fn drive_console(
    mut socket: WebSocket,
    mut output: tokio::sync::broadcast::Receiver<String>,
    input: tokio::sync::mpsc::UnboundedSender<String>,
) {
    loop {
        tokio::select! {
            line = output.recv() => {
                match line {
                    Ok(line) => {
                        if socket.send(Message::Text(line.into())).await.is_err() {
                            return;
                        }
                    }
                    // Slow client lost some lines; keep streaming.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if input.send(text.to_string()).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }
}
