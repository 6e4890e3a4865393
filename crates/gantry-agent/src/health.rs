//! Local liveness endpoint.
//!
//! `GET /healthz` on a loopback port lets host tooling check the agent
//! without a round trip through the control plane.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tracing::info;

use gantry_state::ResourceSnapshot;

use crate::error::AgentResult;

#[derive(Clone)]
struct HealthState {
    node_id: String,
    resources: watch::Receiver<Option<ResourceSnapshot>>,
    started: Instant,
}

pub async fn serve(
    addr: SocketAddr,
    node_id: String,
    resources: watch::Receiver<Option<ResourceSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) -> AgentResult<()> {
    let state = HealthState {
        node_id,
        resources,
        started: Instant::now(),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn healthz(State(state): State<HealthState>) -> Json<serde_json::Value> {
    let resources = state.resources.borrow().clone();
    Json(json!({
        "status": "ok",
        "node_id": state.node_id,
        "resources": resources,
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}
