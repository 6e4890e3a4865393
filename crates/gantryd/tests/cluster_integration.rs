//! Cluster integration tests.
//!
//! In-process scenarios across the control-plane crates: registry
//! persistence, placement over live resource reports, health demotion,
//! scale decisions on the bus, and one full agent round-trip over a real
//! WebSocket listener.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::{oneshot, watch};
use tower::ServiceExt;

use gantry_api::{ApiState, build_router};
use gantry_autoscale::{Autoscaler, ScaleTargets};
use gantry_bus::{AllowAll, BusHub, Envelope, MessageType, Peer};
use gantry_health::HealthMonitor;
use gantry_placement::{PlacementError, Requirements, Strategy, select_node};
use gantry_registry::{NodeRegistration, NodeRegistry};
use gantry_state::{NodeStatus, ResourceSnapshot, ServerStatus, StateStore, epoch_secs};

fn registration(id: &str, location: &str) -> NodeRegistration {
    NodeRegistration {
        id: id.to_string(),
        name: id.to_string(),
        location: location.to_string(),
        address: "10.0.0.1:7070".to_string(),
        capabilities: BTreeSet::new(),
    }
}

fn snapshot(cpu_percent: f64, memory_used_mb: u64) -> ResourceSnapshot {
    ResourceSnapshot {
        cpu_cores: 8,
        cpu_usage_percent: cpu_percent,
        memory_total_mb: 16_000,
        memory_used_mb,
        disk_total_mb: 100_000,
        disk_used_mb: 10_000,
        network_rx_bytes: 0,
        network_tx_bytes: 0,
    }
}

// ── Registry persistence ────────────────────────────────────────

#[test]
fn registry_restores_persisted_nodes_offline() {
    let store = StateStore::open_in_memory().unwrap();
    {
        let registry = NodeRegistry::new(store.clone()).unwrap();
        registry
            .register(registration("node-1", "eu-west"))
            .unwrap();
        registry
            .register(registration("node-2", "us-east"))
            .unwrap();
        registry.connect("node-1", BTreeSet::new()).unwrap();
    }

    // A restarted control plane sees the whole fleet, but trusts nothing
    // as online until agents reconnect.
    let registry = NodeRegistry::new(store).unwrap();
    assert_eq!(registry.count(), 2);
    assert_eq!(registry.online_count(), 0);
    assert_eq!(registry.get("node-1").unwrap().status, NodeStatus::Offline);
}

// ── Placement over live reports ─────────────────────────────────

#[test]
fn placement_prefers_capable_lightly_loaded_node() {
    let registry = NodeRegistry::new(StateStore::open_in_memory().unwrap()).unwrap();
    registry
        .register(registration("node-1", "eu-west"))
        .unwrap();
    registry
        .register(registration("node-2", "eu-west"))
        .unwrap();
    registry.connect("node-1", BTreeSet::new()).unwrap();
    registry
        .connect("node-2", BTreeSet::from(["java-runtime".to_string()]))
        .unwrap();
    registry
        .update_resources("node-1", snapshot(80.0, 12_800))
        .unwrap();
    registry
        .update_resources("node-2", snapshot(30.0, 4_800))
        .unwrap();

    let requirements = Requirements {
        min_cpu_cores: 1.0,
        min_memory_mb: 512,
        capabilities: BTreeSet::from(["java-runtime".to_string()]),
        ..Requirements::default()
    };
    let nodes = registry.list();
    let chosen = select_node(&nodes, &requirements, Strategy::LeastLoaded).unwrap();
    assert_eq!(chosen.id, "node-2");
}

// ── Health demotion ─────────────────────────────────────────────

#[test]
fn failed_node_leaves_the_placement_pool_until_reconnect() {
    let registry =
        Arc::new(NodeRegistry::new(StateStore::open_in_memory().unwrap()).unwrap());
    registry
        .register(registration("node-1", "eu-west"))
        .unwrap();
    registry.connect("node-1", BTreeSet::new()).unwrap();
    registry
        .update_resources("node-1", snapshot(10.0, 1_000))
        .unwrap();

    let requirements = Requirements::default();
    assert!(select_node(&registry.list(), &requirements, Strategy::LeastLoaded).is_ok());

    // Silent for longer than two sweep intervals.
    let monitor = HealthMonitor::new(registry.clone(), Duration::from_secs(30));
    let demoted = monitor.sweep(epoch_secs() + 61);
    assert_eq!(demoted.len(), 1);
    assert_eq!(registry.get("node-1").unwrap().status, NodeStatus::Failed);
    assert_eq!(
        select_node(&registry.list(), &requirements, Strategy::LeastLoaded).unwrap_err(),
        PlacementError::NoSuitableNode
    );

    // Failed sticks through further sweeps; only a reconnect clears it.
    assert!(monitor.sweep(epoch_secs() + 200).is_empty());
    registry.connect("node-1", BTreeSet::new()).unwrap();
    assert!(select_node(&registry.list(), &requirements, Strategy::LeastLoaded).is_ok());
}

// ── Decisions on the bus ────────────────────────────────────────

#[tokio::test]
async fn hot_cluster_scale_out_reaches_observers() {
    let registry =
        Arc::new(NodeRegistry::new(StateStore::open_in_memory().unwrap()).unwrap());
    registry
        .register(registration("node-1", "eu-west"))
        .unwrap();
    registry.connect("node-1", BTreeSet::new()).unwrap();
    registry
        .update_resources("node-1", snapshot(95.0, 15_000))
        .unwrap();

    let hub = Arc::new(BusHub::new(Box::new(AllowAll)));
    let (_observer, mut rx) = hub.attach(Peer::Observer {
        identity: "dash".to_string(),
    });

    let decision_hub = hub.clone();
    let mut autoscaler = Autoscaler::new(registry, ScaleTargets::default()).with_decision_fn(
        Box::new(move |decision| {
            let env = Envelope::new(MessageType::ScaleDecision, decision).unwrap();
            decision_hub.broadcast_all(&env);
        }),
    );
    autoscaler.tick(1_000);

    let env = rx.try_recv().unwrap();
    assert_eq!(env.kind, MessageType::ScaleDecision);
    assert_eq!(env.data["action"], "scale_out");
}

#[tokio::test]
async fn demoted_node_is_announced_on_the_bus() {
    let registry =
        Arc::new(NodeRegistry::new(StateStore::open_in_memory().unwrap()).unwrap());
    registry
        .register(registration("node-1", "eu-west"))
        .unwrap();
    registry.connect("node-1", BTreeSet::new()).unwrap();

    let hub = Arc::new(BusHub::new(Box::new(AllowAll)));
    let (_observer, mut rx) = hub.attach(Peer::Observer {
        identity: "dash".to_string(),
    });

    let degraded_hub = hub.clone();
    let monitor = HealthMonitor::new(registry.clone(), Duration::from_secs(30))
        .with_degraded_fn(Box::new(move |node| {
            let env = Envelope::new(MessageType::ClusterDegraded, node).unwrap();
            degraded_hub.broadcast_all(&env.with_node(&node.id));
        }));
    monitor.sweep(epoch_secs() + 300);

    let env = rx.try_recv().unwrap();
    assert_eq!(env.kind, MessageType::ClusterDegraded);
    assert_eq!(env.node_id.as_deref(), Some("node-1"));
}

// ── Agent round-trip over a live listener ───────────────────────

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Poll until `check` passes. Everything observable here crosses a real
/// socket, so timing is genuinely asynchronous.
async fn wait_for(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn agent_joins_deploys_and_stops_over_websocket() {
    let store = StateStore::open_in_memory().unwrap();
    let state = ApiState {
        store: store.clone(),
        registry: Arc::new(NodeRegistry::new(store).unwrap()),
        hub: Arc::new(BusHub::new(Box::new(AllowAll))),
        default_backup_exclude: Arc::new(Vec::new()),
    };
    state
        .registry
        .register(registration("node-1", "eu-west"))
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serve = axum::serve(listener, build_router(state.clone())).with_graceful_shutdown(
        async move {
            let _ = stop_rx.await;
        },
    );
    let server = tokio::spawn(async move { serve.await });

    let dir = tempfile::tempdir().unwrap();
    let mut config =
        gantry_agent::AgentConfig::new("node-1", &format!("ws://{addr}/ws/agent"), dir.path());
    config.report_interval = Duration::from_millis(200);
    config.health_addr = "127.0.0.1:0".parse().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent = tokio::spawn(gantry_agent::run_agent(config, shutdown_rx));

    // Registration and the first resource report land within a tick.
    wait_for(|| {
        state
            .registry
            .get("node-1")
            .is_some_and(|n| n.is_online() && n.resources.is_some())
    })
    .await;

    // Place a real (tiny) server process through the REST surface.
    let body = r#"{
        "server_type": "minecraft-java",
        "version": "1.21",
        "port": 25565,
        "memory_mb": 64,
        "executable": "sh",
        "args": ["-c", "read line && exit 0"]
    }"#;
    let resp = build_router(state.clone())
        .oneshot(post_json("/api/v1/servers", body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let server_id = body_json(resp).await["data"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    // The agent spawns the process and streams status back up.
    wait_for(|| {
        state
            .store
            .get_server(&server_id)
            .unwrap()
            .is_some_and(|s| s.status == ServerStatus::Running && s.pid.is_some())
    })
    .await;

    // Stop through the API; a clean exit comes back as stopped.
    let resp = build_router(state.clone())
        .oneshot(post_empty(&format!("/api/v1/servers/{server_id}/stop")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    wait_for(|| {
        state
            .store
            .get_server(&server_id)
            .unwrap()
            .is_some_and(|s| s.status == ServerStatus::Stopped)
    })
    .await;

    // Agent shutdown shows up as a disconnect on the control plane.
    shutdown_tx.send(true).unwrap();
    agent.await.unwrap().unwrap();
    wait_for(|| {
        state
            .registry
            .get("node-1")
            .is_some_and(|n| n.status == NodeStatus::Offline)
    })
    .await;

    let _ = stop_tx.send(());
    server.await.unwrap().unwrap();
}
