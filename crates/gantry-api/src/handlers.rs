//! REST API handlers.
//!
//! Each handler delegates to the orchestrator or the node manager and maps
//! lifecycle errors onto HTTP status codes.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use gantry_orchestrator::{CreateNodeRequest, CreateServerRequest, LifecycleError};

use crate::ApiState;

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

fn lifecycle_error_response(err: &LifecycleError) -> axum::response::Response {
    let status = match err {
        LifecycleError::Validation(_) => StatusCode::BAD_REQUEST,
        LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::Conflict(_) => StatusCode::CONFLICT,
        LifecycleError::ResourceExhausted(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LifecycleError::RemoteFailure(_) => StatusCode::BAD_GATEWAY,
        LifecycleError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&err.to_string(), status).into_response()
}

macro_rules! ok_or_status {
    ($result:expr) => {
        match $result {
            Ok(value) => ApiResponse::ok(value).into_response(),
            Err(e) => lifecycle_error_response(&e),
        }
    };
}

// ── Servers ────────────────────────────────────────────────────

/// GET /api/v1/servers
pub async fn list_servers(State(state): State<ApiState>) -> impl IntoResponse {
    ok_or_status!(state.orchestrator.list_servers())
}

/// POST /api/v1/servers
pub async fn create_server(
    State(state): State<ApiState>,
    Json(req): Json<CreateServerRequest>,
) -> impl IntoResponse {
    match state.orchestrator.create_server(req).await {
        Ok(server) => (StatusCode::CREATED, ApiResponse::ok(server)).into_response(),
        Err(e) => lifecycle_error_response(&e),
    }
}

/// GET /api/v1/servers/{id}
pub async fn get_server(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ok_or_status!(state.orchestrator.get_server(&id))
}

/// DELETE /api/v1/servers/{id}
pub async fn delete_server(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.delete_server(&id).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => lifecycle_error_response(&e),
    }
}

/// POST /api/v1/servers/{id}/power/{action}
pub async fn power_action(
    State(state): State<ApiState>,
    Path((id, action)): Path<(String, String)>,
) -> impl IntoResponse {
    let result = match action.as_str() {
        "start" => state.orchestrator.start_server(&id).await,
        "stop" => state.orchestrator.stop_server(&id).await,
        "restart" => state.orchestrator.restart_server(&id).await,
        "kill" => state.orchestrator.kill_server(&id).await,
        _ => {
            return error_response(
                &format!("unknown power action: {action}"),
                StatusCode::BAD_REQUEST,
            )
            .into_response();
        }
    };
    ok_or_status!(result)
}

/// Command request body.
#[derive(Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

/// POST /api/v1/servers/{id}/command
pub async fn send_command(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> impl IntoResponse {
    match state.orchestrator.send_command(&id, &req.command).await {
        Ok(()) => ApiResponse::ok("sent").into_response(),
        Err(e) => lifecycle_error_response(&e),
    }
}

/// Suspend request body.
#[derive(Deserialize)]
pub struct SuspendRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/v1/servers/{id}/suspend
pub async fn suspend_server(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<SuspendRequest>,
) -> impl IntoResponse {
    ok_or_status!(state.orchestrator.suspend_server(&id, req.reason).await)
}

/// POST /api/v1/servers/{id}/unsuspend
pub async fn unsuspend_server(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ok_or_status!(state.orchestrator.unsuspend_server(&id).await)
}

/// POST /api/v1/servers/{id}/reinstall
pub async fn reinstall_server(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ok_or_status!(state.orchestrator.reinstall_server(&id).await)
}

/// GET /api/v1/servers/{id}/stats
pub async fn server_stats(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ok_or_status!(state.orchestrator.server_stats(&id).await)
}

/// POST /api/v1/servers/{id}/installed — agent callback.
pub async fn server_installed(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ok_or_status!(state.orchestrator.mark_installed(&id).await)
}

// ── Backups ────────────────────────────────────────────────────

/// Backup request body.
#[derive(Deserialize)]
pub struct BackupRequest {
    #[serde(default)]
    pub name: String,
}

/// GET /api/v1/servers/{id}/backups
pub async fn list_backups(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ok_or_status!(state.orchestrator.list_backups(&id))
}

/// POST /api/v1/servers/{id}/backups
pub async fn create_backup(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<BackupRequest>,
) -> impl IntoResponse {
    match state.orchestrator.create_backup(&id, &req.name).await {
        Ok(backup) => (StatusCode::ACCEPTED, ApiResponse::ok(backup)).into_response(),
        Err(e) => lifecycle_error_response(&e),
    }
}

/// Backup completion callback body.
#[derive(Deserialize)]
pub struct BackupCompletedRequest {
    pub checksum: String,
    pub size_bytes: u64,
}

/// POST /api/v1/servers/{id}/backups/{bid}/completed — agent callback.
pub async fn backup_completed(
    State(state): State<ApiState>,
    Path((id, bid)): Path<(String, String)>,
    Json(req): Json<BackupCompletedRequest>,
) -> impl IntoResponse {
    ok_or_status!(state
        .orchestrator
        .backup_completed(&id, &bid, &req.checksum, req.size_bytes))
}

/// Backup failure callback body.
#[derive(Deserialize)]
pub struct BackupFailedRequest {
    pub error: String,
}

/// POST /api/v1/servers/{id}/backups/{bid}/failed — agent callback.
pub async fn backup_failed(
    State(state): State<ApiState>,
    Path((id, bid)): Path<(String, String)>,
    Json(req): Json<BackupFailedRequest>,
) -> impl IntoResponse {
    ok_or_status!(state.orchestrator.backup_failed(&id, &bid, &req.error))
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    ok_or_status!(state.nodes.list_nodes())
}

/// POST /api/v1/nodes
pub async fn create_node(
    State(state): State<ApiState>,
    Json(req): Json<CreateNodeRequest>,
) -> impl IntoResponse {
    match state.nodes.create_node(req) {
        Ok(node) => (StatusCode::CREATED, ApiResponse::ok(node)).into_response(),
        Err(e) => lifecycle_error_response(&e),
    }
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    ok_or_status!(state.nodes.get_node(&id))
}

/// PUT /api/v1/nodes/{id}
pub async fn update_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CreateNodeRequest>,
) -> impl IntoResponse {
    ok_or_status!(state.nodes.update_node(&id, req))
}

/// DELETE /api/v1/nodes/{id}
pub async fn delete_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.nodes.delete_node(&id) {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => lifecycle_error_response(&e),
    }
}

/// Maintenance request body.
#[derive(Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

/// POST /api/v1/nodes/{id}/maintenance
pub async fn set_maintenance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<MaintenanceRequest>,
) -> impl IntoResponse {
    ok_or_status!(state.nodes.set_maintenance(&id, req.enabled))
}

/// POST /api/v1/nodes/{id}/token
pub async fn regenerate_token(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ok_or_status!(state.nodes.regenerate_token(&id))
}

/// GET /api/v1/nodes/{id}/configuration
pub async fn node_configuration(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ok_or_status!(state.nodes.configuration(&id, &state.remote_base))
}

/// Agent announce body.
#[derive(Deserialize)]
pub struct RegisterRequest {
    pub token: String,
    pub listen_port: u16,
}

/// POST /api/v1/nodes/{id}/register — agent callback.
pub async fn register_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    ok_or_status!(state.nodes.register_node(&id, &req.token, req.listen_port))
}

/// GET /api/v1/nodes/{id}/servers — agent adoption pull.
pub async fn node_servers(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ok_or_status!(state.orchestrator.server_specs_for_node(&id))
}

// ── Allocations ────────────────────────────────────────────────

/// Port range request body.
#[derive(Deserialize)]
pub struct AllocationRequest {
    pub ip: String,
    pub port_start: u16,
    pub port_end: u16,
    #[serde(default)]
    pub alias: String,
}

/// GET /api/v1/nodes/{id}/allocations
pub async fn list_allocations(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ok_or_status!(state.nodes.list_allocations(&id))
}

/// POST /api/v1/nodes/{id}/allocations
pub async fn create_allocations(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<AllocationRequest>,
) -> impl IntoResponse {
    match state
        .nodes
        .create_allocations(&id, &req.ip, req.port_start, req.port_end, &req.alias)
    {
        Ok(allocations) => (StatusCode::CREATED, ApiResponse::ok(allocations)).into_response(),
        Err(e) => lifecycle_error_response(&e),
    }
}

/// DELETE /api/v1/nodes/{id}/allocations/{ip}/{port}
pub async fn delete_allocation(
    State(state): State<ApiState>,
    Path((id, ip, port)): Path<(String, String, u16)>,
) -> impl IntoResponse {
    match state.nodes.delete_allocation(&id, port, &ip) {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => lifecycle_error_response(&e),
    }
}

// ── Locations ──────────────────────────────────────────────────

/// Location request body.
#[derive(Deserialize)]
pub struct LocationRequest {
    pub short_code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// GET /api/v1/locations
pub async fn list_locations(State(state): State<ApiState>) -> impl IntoResponse {
    ok_or_status!(state.nodes.list_locations())
}

/// POST /api/v1/locations
pub async fn create_location(
    State(state): State<ApiState>,
    Json(req): Json<LocationRequest>,
) -> impl IntoResponse {
    match state
        .nodes
        .create_location(&req.short_code, &req.name, &req.description)
    {
        Ok(location) => (StatusCode::CREATED, ApiResponse::ok(location)).into_response(),
        Err(e) => lifecycle_error_response(&e),
    }
}

/// DELETE /api/v1/locations/{id}
pub async fn delete_location(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.nodes.delete_location(&id) {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => lifecycle_error_response(&e),
    }
}
