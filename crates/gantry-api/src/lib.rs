//! gantry-api — REST API for the Gantry control plane.
//!
//! Provides axum route handlers for servers, nodes, allocations, and
//! locations, plus the callback routes node agents report back through.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/servers` | List all servers |
//! | POST | `/api/v1/servers` | Create a server |
//! | GET | `/api/v1/servers/{id}` | Get server details |
//! | DELETE | `/api/v1/servers/{id}` | Delete a server |
//! | POST | `/api/v1/servers/{id}/power/{action}` | start, stop, restart, kill |
//! | POST | `/api/v1/servers/{id}/command` | Send a console command |
//! | POST | `/api/v1/servers/{id}/suspend` | Suspend a server |
//! | POST | `/api/v1/servers/{id}/unsuspend` | Lift a suspension |
//! | POST | `/api/v1/servers/{id}/reinstall` | Reinstall from the image |
//! | GET | `/api/v1/servers/{id}/stats` | Live resource usage |
//! | GET | `/api/v1/servers/{id}/backups` | List backups |
//! | POST | `/api/v1/servers/{id}/backups` | Request a backup |
//! | POST | `/api/v1/servers/{id}/installed` | Agent: install finished |
//! | POST | `/api/v1/servers/{id}/backups/{bid}/completed` | Agent: backup done |
//! | POST | `/api/v1/servers/{id}/backups/{bid}/failed` | Agent: backup failed |
//! | GET | `/api/v1/nodes` | List nodes |
//! | POST | `/api/v1/nodes` | Create a node |
//! | GET | `/api/v1/nodes/{id}` | Get node details |
//! | PUT | `/api/v1/nodes/{id}` | Update a node |
//! | DELETE | `/api/v1/nodes/{id}` | Delete a node |
//! | POST | `/api/v1/nodes/{id}/maintenance` | Toggle maintenance mode |
//! | POST | `/api/v1/nodes/{id}/token` | Regenerate the daemon token |
//! | GET | `/api/v1/nodes/{id}/configuration` | Agent bootstrap document |
//! | POST | `/api/v1/nodes/{id}/register` | Agent: announce online |
//! | GET | `/api/v1/nodes/{id}/servers` | Agent: specs for adoption |
//! | GET | `/api/v1/nodes/{id}/allocations` | List port allocations |
//! | POST | `/api/v1/nodes/{id}/allocations` | Add a port range |
//! | DELETE | `/api/v1/nodes/{id}/allocations/{ip}/{port}` | Remove one port |
//! | GET | `/api/v1/locations` | List locations |
//! | POST | `/api/v1/locations` | Create a location |
//! | DELETE | `/api/v1/locations/{id}` | Delete a location |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use gantry_orchestrator::{NodeManager, Orchestrator};
use gantry_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub nodes: NodeManager,
    pub store: StateStore,
    /// This panel's own base URL, handed to agents in their configuration.
    pub remote_base: String,
}

/// Build the complete control-plane router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/servers", get(handlers::list_servers).post(handlers::create_server))
        .route("/servers/{id}", get(handlers::get_server).delete(handlers::delete_server))
        .route("/servers/{id}/power/{action}", post(handlers::power_action))
        .route("/servers/{id}/command", post(handlers::send_command))
        .route("/servers/{id}/suspend", post(handlers::suspend_server))
        .route("/servers/{id}/unsuspend", post(handlers::unsuspend_server))
        .route("/servers/{id}/reinstall", post(handlers::reinstall_server))
        .route("/servers/{id}/stats", get(handlers::server_stats))
        .route("/servers/{id}/installed", post(handlers::server_installed))
        .route(
            "/servers/{id}/backups",
            get(handlers::list_backups).post(handlers::create_backup),
        )
        .route(
            "/servers/{id}/backups/{bid}/completed",
            post(handlers::backup_completed),
        )
        .route(
            "/servers/{id}/backups/{bid}/failed",
            post(handlers::backup_failed),
        )
        .route("/nodes", get(handlers::list_nodes).post(handlers::create_node))
        .route(
            "/nodes/{id}",
            get(handlers::get_node)
                .put(handlers::update_node)
                .delete(handlers::delete_node),
        )
        .route("/nodes/{id}/maintenance", post(handlers::set_maintenance))
        .route("/nodes/{id}/token", post(handlers::regenerate_token))
        .route("/nodes/{id}/configuration", get(handlers::node_configuration))
        .route("/nodes/{id}/register", post(handlers::register_node))
        .route("/nodes/{id}/servers", get(handlers::node_servers))
        .route(
            "/nodes/{id}/allocations",
            get(handlers::list_allocations).post(handlers::create_allocations),
        )
        .route(
            "/nodes/{id}/allocations/{ip}/{port}",
            axum::routing::delete(handlers::delete_allocation),
        )
        .route(
            "/locations",
            get(handlers::list_locations).post(handlers::create_location),
        )
        .route("/locations/{id}", axum::routing::delete(handlers::delete_location))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
