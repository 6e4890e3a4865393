//! Control plane mode — the cluster's single coordinating process.
//!
//! In this mode, the daemon:
//! 1. Opens the state store and restores the node registry from it
//! 2. Builds the bus hub with the configured access policy
//! 3. Runs the health monitor and autoscaler as background tasks
//! 4. Serves the REST API and both bus endpoints on one listener

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use gantry_api::{ApiState, build_router};
use gantry_autoscale::Autoscaler;
use gantry_bus::{AccessPolicy, AllowAll, BusHub, Envelope, MessageType, SharedToken};
use gantry_health::HealthMonitor;
use gantry_registry::NodeRegistry;
use gantry_state::StateStore;

use crate::config::GantryConfig;

/// Run the control plane until ctrl-c.
pub async fn run_control_plane(config: GantryConfig) -> anyhow::Result<()> {
    info!("Gantry daemon starting in control-plane mode");
    std::fs::create_dir_all(&config.data_dir)?;

    // ── State store and registry ───────────────────────────────
    let db_path = config.data_dir.join("gantry.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Persisted nodes come back offline until their agents reconnect.
    let registry = Arc::new(NodeRegistry::new(store.clone())?);
    info!(nodes = registry.count(), "node registry restored");

    // ── Bus hub ────────────────────────────────────────────────
    let policy: Box<dyn AccessPolicy> = if config.agent_token.is_empty() {
        warn!("no agent token configured, accepting any agent");
        Box::new(AllowAll)
    } else {
        Box::new(SharedToken::new(&config.agent_token))
    };
    let hub = Arc::new(BusHub::new(policy));

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health_shutdown = shutdown_rx.clone();
    let autoscale_shutdown = shutdown_rx.clone();

    // ── Background tasks ───────────────────────────────────────

    // Health monitor; every demotion goes out as a cluster_degraded
    // envelope so observers see the fleet shrink.
    let degraded_hub = hub.clone();
    let monitor = HealthMonitor::new(
        registry.clone(),
        Duration::from_secs(config.health_interval_secs),
    )
    .with_degraded_fn(Box::new(move |node| {
        match Envelope::new(MessageType::ClusterDegraded, node) {
            Ok(env) => {
                degraded_hub.broadcast_all(&env.with_node(&node.id));
            }
            Err(e) => warn!(error = %e, "degraded envelope encode failed"),
        }
    }));
    info!(interval_secs = config.health_interval_secs, "health monitor initialized");
    let health_handle = tokio::spawn(async move {
        monitor.run(health_shutdown).await;
    });

    // Autoscaler; non-hold decisions are broadcast as scale_decision
    // envelopes. Acting on them (provisioning) is external.
    let decision_hub = hub.clone();
    let mut autoscaler = Autoscaler::new(registry.clone(), config.autoscale.scale_targets())
        .with_decision_fn(Box::new(move |decision| {
            match Envelope::new(MessageType::ScaleDecision, decision) {
                Ok(env) => {
                    decision_hub.broadcast_all(&env);
                }
                Err(e) => warn!(error = %e, "scale decision encode failed"),
            }
        }));
    info!(interval_secs = config.autoscale_interval_secs, "autoscaler initialized");
    let autoscale_interval = Duration::from_secs(config.autoscale_interval_secs);
    let autoscale_handle = tokio::spawn(async move {
        autoscaler.run(autoscale_interval, autoscale_shutdown).await;
    });

    // ── REST API + bus endpoints ───────────────────────────────
    let state = ApiState {
        store,
        registry,
        hub: hub.clone(),
        default_backup_exclude: Arc::new(config.backup_exclude.clone()),
    };
    let router = build_router(state);

    info!(addr = %config.bind_addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks, then drop whatever channels remain.
    let _ = health_handle.await;
    let _ = autoscale_handle.await;
    hub.drain();

    info!("control plane stopped");
    Ok(())
}
