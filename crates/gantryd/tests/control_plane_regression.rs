//! Control-plane regression tests.
//!
//! Drives the assembled router the way a dashboard would: request in,
//! status code out, with an agent channel attached wherever a command has
//! to land somewhere.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::mpsc;
use tower::ServiceExt;

use gantry_api::{ApiState, build_router};
use gantry_bus::{AllowAll, BusHub, Envelope, MessageType, Peer};
use gantry_registry::{NodeRegistration, NodeRegistry};
use gantry_state::{ResourceSnapshot, StateStore};

fn test_state() -> ApiState {
    let store = StateStore::open_in_memory().unwrap();
    ApiState {
        store: store.clone(),
        registry: Arc::new(NodeRegistry::new(store).unwrap()),
        hub: Arc::new(BusHub::new(Box::new(AllowAll))),
        default_backup_exclude: Arc::new(Vec::new()),
    }
}

fn registration(id: &str) -> NodeRegistration {
    NodeRegistration {
        id: id.to_string(),
        name: id.to_string(),
        location: "eu-west".to_string(),
        address: "10.0.0.1:7070".to_string(),
        capabilities: BTreeSet::new(),
    }
}

/// Register a node, mark it online with resources, and attach an agent
/// channel. The returned receiver observes dispatched commands.
fn online_node(state: &ApiState, id: &str) -> mpsc::UnboundedReceiver<Envelope> {
    state.registry.register(registration(id)).unwrap();
    state.registry.connect(id, BTreeSet::new()).unwrap();
    state
        .registry
        .update_resources(
            id,
            ResourceSnapshot {
                cpu_cores: 8,
                cpu_usage_percent: 20.0,
                memory_total_mb: 16_000,
                memory_used_mb: 4_000,
                disk_total_mb: 100_000,
                disk_used_mb: 10_000,
                network_rx_bytes: 0,
                network_tx_bytes: 0,
            },
        )
        .unwrap();
    let (_channel, rx) = state.hub.attach(Peer::Agent {
        node_id: id.to_string(),
    });
    rx
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

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

const CREATE_SERVER_BODY: &str = r#"{
    "server_type": "minecraft-java",
    "version": "1.21",
    "port": 25565,
    "memory_mb": 512,
    "executable": "java"
}"#;

#[tokio::test]
async fn api_list_nodes_empty() {
    let router = build_router(test_state());

    let resp = router.oneshot(get("/api/v1/nodes")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_register_get_and_duplicate_node() {
    let router = build_router(test_state());
    let body = serde_json::to_string(&registration("node-1")).unwrap();

    let resp = router
        .clone()
        .oneshot(post_json("/api/v1/nodes", &body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = router
        .clone()
        .oneshot(get("/api/v1/nodes/node-1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .oneshot(post_json("/api/v1/nodes", &body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn api_deregister_node() {
    let state = test_state();
    state.registry.register(registration("node-1")).unwrap();
    let router = build_router(state);

    let resp = router
        .clone()
        .oneshot(delete("/api/v1/nodes/node-1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router.oneshot(get("/api/v1/nodes/node-1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_drain_node() {
    let state = test_state();
    let _rx = online_node(&state, "node-1");
    let router = build_router(state);

    let resp = router
        .oneshot(post_empty("/api/v1/nodes/node-1/drain"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_create_server_without_nodes_unavailable() {
    let router = build_router(test_state());

    let resp = router
        .oneshot(post_json("/api/v1/servers", CREATE_SERVER_BODY))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn api_create_server_reaches_agent() {
    let state = test_state();
    let mut rx = online_node(&state, "node-1");
    let router = build_router(state);

    let resp = router
        .clone()
        .oneshot(post_json("/api/v1/servers", CREATE_SERVER_BODY))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let env = rx.try_recv().unwrap();
    assert_eq!(env.kind, MessageType::DeployServer);

    let resp = router.oneshot(get("/api/v1/servers")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_stop_unknown_server_not_found() {
    let router = build_router(test_state());

    let resp = router
        .oneshot(post_empty("/api/v1/servers/srv-missing/stop"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_backup_request_and_in_progress_delete() {
    let state = test_state();
    let mut rx = online_node(&state, "node-1");
    let router = build_router(state);

    let resp = router
        .clone()
        .oneshot(post_json("/api/v1/servers", CREATE_SERVER_BODY))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let server = body_json(resp).await["data"].clone();
    let server_id = server["id"].as_str().unwrap().to_string();
    let deploy = rx.try_recv().unwrap();
    assert_eq!(deploy.kind, MessageType::DeployServer);

    let resp = router
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/servers/{server_id}/backups"),
            r#"{"name": "nightly"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let backup = body_json(resp).await["data"].clone();
    assert_eq!(backup["status"], "creating");
    let backup_id = backup["id"].as_str().unwrap().to_string();

    // In-flight backups refuse deletion.
    let resp = router
        .clone()
        .oneshot(delete(&format!("/api/v1/backups/{backup_id}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = router
        .oneshot(get(&format!("/api/v1/servers/{server_id}/backups")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_cluster_summary() {
    let state = test_state();
    let _rx = online_node(&state, "node-1");
    let router = build_router(state);

    let resp = router.oneshot(get("/api/v1/cluster/summary")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let value = body_json(resp).await;
    assert_eq!(value["success"], true);
    assert_eq!(value["data"]["nodes_online"], 1);
}
