//! REST API handlers.
//!
//! Reads go through the registry (nodes) and the state store (servers,
//! backups). Anything that touches a live process is delegated: the
//! handler validates, persists intent, and dispatches an envelope to the
//! owning node's agent channel. Delegated operations answer `202` before
//! the agent has acted; progress arrives over the bus.

use std::collections::BTreeSet;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::info;

use gantry_bus::{BackupRequest, CommandPayload, DeploySpec, Envelope, MessageType, RestoreRequest};
use gantry_placement::{Requirements, Strategy, select_node};
use gantry_registry::{NodeRegistration, RegistryError};
use gantry_state::*;

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

// ── Nodes ──────────────────────────────────────────────────────

/// POST /api/v1/nodes
pub async fn register_node(
    State(state): State<ApiState>,
    Json(reg): Json<NodeRegistration>,
) -> impl IntoResponse {
    match state.registry.register(reg) {
        Ok(node) => (StatusCode::CREATED, ApiResponse::ok(node)).into_response(),
        Err(e @ RegistryError::DuplicateNode(_)) => {
            error_response(&e.to_string(), StatusCode::CONFLICT).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.list())
}

/// GET /api/v1/nodes/:id
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.registry.get(&id) {
        Some(node) => ApiResponse::ok(node).into_response(),
        None => error_response("node not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// DELETE /api/v1/nodes/:id
pub async fn deregister_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.deregister(&id) {
        Ok(node) => ApiResponse::ok(node).into_response(),
        Err(e @ RegistryError::UnknownNode(_)) => {
            error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/nodes/:id/drain
///
/// Marks the node draining so placement stops considering it. Servers
/// already on the node keep running.
pub async fn drain_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.registry.set_status(&id, NodeStatus::Draining) {
        Ok(()) => match state.registry.get(&id) {
            Some(node) => ApiResponse::ok(node).into_response(),
            None => error_response("node not found", StatusCode::NOT_FOUND).into_response(),
        },
        Err(e @ RegistryError::UnknownNode(_)) => {
            error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response()
        }
        Err(e @ RegistryError::InvalidTransition { .. }) => {
            error_response(&e.to_string(), StatusCode::CONFLICT).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Servers ────────────────────────────────────────────────────

/// Server creation request body.
#[derive(serde::Deserialize)]
pub struct CreateServerRequest {
    pub server_type: String,
    pub version: String,
    pub port: u16,
    pub memory_mb: u64,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub disk_mb: u64,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub preferred_location: Option<String>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub artifact: Option<String>,
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub stop_line: Option<String>,
}

/// GET /api/v1/servers
pub async fn list_servers(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_servers() {
        Ok(servers) => ApiResponse::ok(servers).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/servers/:id
pub async fn get_server(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_server(&id) {
        Ok(Some(server)) => ApiResponse::ok(server).into_response(),
        Ok(None) => error_response("server not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/servers
///
/// Places the server, persists the record, and dispatches the deploy to
/// the chosen node's agent. `503` when no node satisfies the
/// requirements.
pub async fn create_server(
    State(state): State<ApiState>,
    Json(req): Json<CreateServerRequest>,
) -> impl IntoResponse {
    let requirements = Requirements {
        min_cpu_cores: req.cpu_cores as f64,
        min_memory_mb: req.memory_mb,
        min_disk_mb: req.disk_mb,
        capabilities: req.capabilities.clone(),
        preferred_location: req.preferred_location.clone(),
    };
    let nodes = state.registry.list();
    let node_id = match select_node(&nodes, &requirements, req.strategy) {
        Ok(node) => node.id.clone(),
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response();
        }
    };

    // Placement sees registry state; the live channel is the ground truth
    // for whether the agent can receive the deploy at all.
    if !state.hub.node_connected(&node_id) {
        return error_response(
            &format!("node {node_id} has no connected agent"),
            StatusCode::CONFLICT,
        )
        .into_response();
    }

    let record = ServerRecord {
        id: generate_id("srv"),
        node_id: node_id.clone(),
        server_type: req.server_type.clone(),
        version: req.version.clone(),
        port: req.port,
        limits: ResourceLimits {
            memory_mb: req.memory_mb,
            cpu_cores: req.cpu_cores,
            disk_mb: req.disk_mb,
        },
        status: ServerStatus::Stopped,
        pid: None,
        auto_restart: req.auto_restart,
        last_backup_at: None,
        created_at: epoch_secs(),
    };
    if let Err(e) = state.store.put_server(&record) {
        return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response();
    }

    let spec = DeploySpec {
        server_id: record.id.clone(),
        server_type: req.server_type,
        version: req.version,
        port: req.port,
        memory_mb: req.memory_mb,
        artifact: req.artifact,
        executable: req.executable,
        args: req.args,
        auto_restart: req.auto_restart,
        stop_line: req.stop_line,
    };
    let envelope = match Envelope::new(MessageType::DeployServer, &spec) {
        Ok(env) => env.with_server(&record.id),
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    if let Err(e) = state.hub.send_to_node(&node_id, envelope) {
        // The agent dropped between the check and the send.
        let _ = state.store.delete_server(&record.id);
        return error_response(&e.to_string(), StatusCode::CONFLICT).into_response();
    }

    info!(server_id = %record.id, %node_id, "server placed, deploy dispatched");
    (StatusCode::CREATED, ApiResponse::ok(record)).into_response()
}

/// Common path for stop/restart/command: the record must exist and the
/// owning node must be online with a live agent channel.
fn dispatch_to_server(state: &ApiState, server_id: &str, envelope: Envelope) -> Response {
    let record = match state.store.get_server(server_id) {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response("server not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };

    match state.registry.get(&record.node_id) {
        Some(node) if node.is_online() => {}
        Some(node) => {
            return error_response(
                &format!("node {} is {:?}", node.id, node.status),
                StatusCode::CONFLICT,
            )
            .into_response();
        }
        None => {
            return error_response("owning node is gone", StatusCode::CONFLICT).into_response();
        }
    }

    if let Err(e) = state.hub.send_to_node(&record.node_id, envelope) {
        return error_response(&e.to_string(), StatusCode::CONFLICT).into_response();
    }

    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(serde_json::json!({ "server_id": server_id })),
    )
        .into_response()
}

/// POST /api/v1/servers/:id/stop
pub async fn stop_server(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    dispatch_to_server(
        &state,
        &id,
        Envelope::bare(MessageType::StopServer).with_server(&id),
    )
}

/// POST /api/v1/servers/:id/restart
pub async fn restart_server(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    dispatch_to_server(
        &state,
        &id,
        Envelope::bare(MessageType::RestartServer).with_server(&id),
    )
}

/// POST /api/v1/servers/:id/command
pub async fn send_command(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(cmd): Json<CommandPayload>,
) -> impl IntoResponse {
    let envelope = match Envelope::new(MessageType::SendCommand, &cmd) {
        Ok(env) => env.with_server(&id),
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    dispatch_to_server(&state, &id, envelope)
}

// ── Backups ────────────────────────────────────────────────────

/// Backup creation request body.
#[derive(serde::Deserialize)]
pub struct BackupCreateRequest {
    pub name: String,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub locked: bool,
}

/// GET /api/v1/servers/:id/backups
pub async fn list_backups(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_server(&id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response("server not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    }
    match state.store.list_backups_for_server(&id) {
        Ok(backups) => ApiResponse::ok(backups).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/servers/:id/backups
///
/// One backup in flight per server; a second request while one is
/// creating or restoring answers `409`.
pub async fn create_backup(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<BackupCreateRequest>,
) -> impl IntoResponse {
    let server = match state.store.get_server(&id) {
        Ok(Some(server)) => server,
        Ok(None) => {
            return error_response("server not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };

    match state.store.list_backups_for_server(&id) {
        Ok(backups) if backups.iter().any(|b| b.in_progress()) => {
            return error_response(
                "a backup is already in progress for this server",
                StatusCode::CONFLICT,
            )
            .into_response();
        }
        Ok(_) => {}
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    }

    match state.registry.get(&server.node_id) {
        Some(node) if node.is_online() => {}
        _ => {
            return error_response(
                &format!("node {} is not online", server.node_id),
                StatusCode::CONFLICT,
            )
            .into_response();
        }
    }

    // Requests that name no patterns inherit the configured defaults.
    let exclude_patterns = if req.exclude_patterns.is_empty() {
        state.default_backup_exclude.as_ref().clone()
    } else {
        req.exclude_patterns
    };

    let mut record = BackupRecord {
        id: generate_id("bak"),
        server_id: id.clone(),
        name: req.name.clone(),
        status: BackupStatus::Pending,
        archive_path: None,
        size_bytes: 0,
        sha256: None,
        exclude_patterns: exclude_patterns.clone(),
        error: None,
        locked: req.locked,
        started_at: epoch_secs(),
        completed_at: None,
    };
    if let Err(e) = state.store.put_backup(&record) {
        return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response();
    }

    let request = BackupRequest {
        backup_id: record.id.clone(),
        name: req.name,
        exclude_patterns,
    };
    let envelope = match Envelope::new(MessageType::BackupServer, &request) {
        Ok(env) => env.with_server(&id),
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    if let Err(e) = state.hub.send_to_node(&server.node_id, envelope) {
        // Never reached the agent; drop the record rather than leave a
        // stuck pending entry.
        let _ = state.store.delete_backup(&record.id);
        return error_response(&e.to_string(), StatusCode::CONFLICT).into_response();
    }

    record.status = BackupStatus::Creating;
    if let Err(e) = state.store.put_backup(&record) {
        return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response();
    }

    info!(backup_id = %record.id, server_id = %id, "backup dispatched");
    (StatusCode::ACCEPTED, ApiResponse::ok(record)).into_response()
}

/// POST /api/v1/backups/:id/restore
///
/// Only completed backups restore, and only onto a server that is not
/// running. The record flips to `restoring` until the agent reports back.
pub async fn restore_backup(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let mut backup = match state.store.get_backup(&id) {
        Ok(Some(backup)) => backup,
        Ok(None) => {
            return error_response("backup not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    if backup.in_progress() {
        return error_response("backup is in progress", StatusCode::CONFLICT).into_response();
    }
    if backup.status != BackupStatus::Completed {
        return error_response("only completed backups can be restored", StatusCode::CONFLICT)
            .into_response();
    }
    let Some(archive_path) = backup.archive_path.clone() else {
        return error_response("backup has no archive", StatusCode::CONFLICT).into_response();
    };

    let server = match state.store.get_server(&backup.server_id) {
        Ok(Some(server)) => server,
        Ok(None) => {
            return error_response("server not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    if matches!(
        server.status,
        ServerStatus::Starting | ServerStatus::Running | ServerStatus::Stopping
    ) {
        return error_response(
            "server is running; stop it before restoring",
            StatusCode::CONFLICT,
        )
        .into_response();
    }
    match state.registry.get(&server.node_id) {
        Some(node) if node.is_online() => {}
        _ => {
            return error_response(
                &format!("node {} is not online", server.node_id),
                StatusCode::CONFLICT,
            )
            .into_response();
        }
    }

    let request = RestoreRequest {
        backup_id: backup.id.clone(),
        archive_path,
        sha256: backup.sha256.clone(),
    };
    let envelope = match Envelope::new(MessageType::RestoreBackup, &request) {
        Ok(env) => env.with_server(&backup.server_id),
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };

    // Flip to restoring before the send so the agent's report always
    // finds the record in the restoring state.
    backup.status = BackupStatus::Restoring;
    if let Err(e) = state.store.put_backup(&backup) {
        return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response();
    }
    if let Err(e) = state.hub.send_to_node(&server.node_id, envelope) {
        // Never reached the agent; the archive is untouched.
        backup.status = BackupStatus::Completed;
        let _ = state.store.put_backup(&backup);
        return error_response(&e.to_string(), StatusCode::CONFLICT).into_response();
    }

    info!(backup_id = %backup.id, server_id = %backup.server_id, "restore dispatched");
    (StatusCode::ACCEPTED, ApiResponse::ok(backup)).into_response()
}

/// DELETE /api/v1/backups/:id
///
/// Removes the record only; archives on nodes are cleaned up by
/// node-side retention.
pub async fn delete_backup(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let backup = match state.store.get_backup(&id) {
        Ok(Some(backup)) => backup,
        Ok(None) => {
            return error_response("backup not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    if !backup.deletable() {
        return error_response("backup is locked or in progress", StatusCode::CONFLICT)
            .into_response();
    }
    match state.store.delete_backup(&id) {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("backup not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Cluster ────────────────────────────────────────────────────

/// Aggregate cluster view for dashboards.
#[derive(serde::Serialize)]
pub struct ClusterSummary {
    pub nodes_total: usize,
    pub nodes_online: usize,
    pub servers_total: usize,
    pub servers_running: usize,
    pub mean_cpu_percent: f64,
    pub mean_memory_percent: f64,
}

/// GET /api/v1/cluster/summary
pub async fn cluster_summary(State(state): State<ApiState>) -> impl IntoResponse {
    let servers = match state.store.list_servers() {
        Ok(servers) => servers,
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    let nodes = state.registry.list();

    // Means over online nodes that have reported at least once.
    let reporting: Vec<&ResourceSnapshot> = nodes
        .iter()
        .filter(|n| n.is_online())
        .filter_map(|n| n.resources.as_ref())
        .collect();
    let (mean_cpu, mean_memory) = if reporting.is_empty() {
        (0.0, 0.0)
    } else {
        let count = reporting.len() as f64;
        (
            reporting.iter().map(|r| r.cpu_usage_percent).sum::<f64>() / count,
            reporting.iter().map(|r| r.memory_usage_percent()).sum::<f64>() / count,
        )
    };

    ApiResponse::ok(ClusterSummary {
        nodes_total: nodes.len(),
        nodes_online: nodes.iter().filter(|n| n.is_online()).count(),
        servers_total: servers.len(),
        servers_running: servers
            .iter()
            .filter(|s| s.status == ServerStatus::Running)
            .count(),
        mean_cpu_percent: mean_cpu,
        mean_memory_percent: mean_memory,
    })
    .into_response()
}
