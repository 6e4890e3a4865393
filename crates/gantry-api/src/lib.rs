//! gantry-api — the control plane's HTTP surface.
//!
//! REST routes for fleet administration plus the two WebSocket endpoints
//! the bus rides on. REST handlers read through the registry and state
//! store and delegate execution to node agents over the bus; nothing runs
//! game servers in this process.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/nodes` | Register a node |
//! | GET | `/api/v1/nodes` | List nodes |
//! | GET | `/api/v1/nodes/{id}` | Get one node |
//! | DELETE | `/api/v1/nodes/{id}` | Deregister a node |
//! | POST | `/api/v1/nodes/{id}/drain` | Start draining a node |
//! | POST | `/api/v1/servers` | Place and deploy a server |
//! | GET | `/api/v1/servers` | List server records |
//! | GET | `/api/v1/servers/{id}` | Get one server record |
//! | POST | `/api/v1/servers/{id}/stop` | Stop the server process |
//! | POST | `/api/v1/servers/{id}/restart` | Restart the server process |
//! | POST | `/api/v1/servers/{id}/command` | Send a console command |
//! | POST | `/api/v1/servers/{id}/backups` | Request a backup |
//! | GET | `/api/v1/servers/{id}/backups` | List backups of a server |
//! | POST | `/api/v1/backups/{id}/restore` | Restore from a backup |
//! | DELETE | `/api/v1/backups/{id}` | Delete a backup record |
//! | GET | `/api/v1/cluster/summary` | Node counts and mean load |
//! | GET | `/ws/agent` | Agent bus endpoint (WebSocket) |
//! | GET | `/ws/observer` | Observer bus endpoint (WebSocket) |

pub mod handlers;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};

use gantry_bus::BusHub;
use gantry_registry::NodeRegistry;
use gantry_state::StateStore;

/// Shared state for REST and WebSocket handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub registry: Arc<NodeRegistry>,
    pub hub: Arc<BusHub>,
    /// Exclude patterns applied to backup requests that name none.
    pub default_backup_exclude: Arc<Vec<String>>,
}

/// Build the complete control-plane router (REST + bus endpoints).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/nodes",
            get(handlers::list_nodes).post(handlers::register_node),
        )
        .route(
            "/nodes/{id}",
            get(handlers::get_node).delete(handlers::deregister_node),
        )
        .route("/nodes/{id}/drain", post(handlers::drain_node))
        .route(
            "/servers",
            get(handlers::list_servers).post(handlers::create_server),
        )
        .route("/servers/{id}", get(handlers::get_server))
        .route("/servers/{id}/stop", post(handlers::stop_server))
        .route("/servers/{id}/restart", post(handlers::restart_server))
        .route("/servers/{id}/command", post(handlers::send_command))
        .route(
            "/servers/{id}/backups",
            get(handlers::list_backups).post(handlers::create_backup),
        )
        .route("/backups/{id}", delete(handlers::delete_backup))
        .route("/backups/{id}/restore", post(handlers::restore_backup))
        .route("/cluster/summary", get(handlers::cluster_summary))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws/agent", get(ws::agent_ws))
        .route("/ws/observer", get(ws::observer_ws))
        .with_state(state)
}
