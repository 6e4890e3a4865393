//! WebSocket transport for the bus.
//!
//! Two endpoints: `/ws/agent` for node agents and `/ws/observer` for
//! dashboards and console clients. Each connection gets a hub channel;
//! a pump task moves hub-addressed envelopes onto the socket while the
//! receive loop applies inbound envelopes to control-plane state.
//!
//! Agents must send a `node_registration` envelope as their first frame;
//! a bad handshake gets one `error` envelope and the socket closes.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use gantry_bus::{
    BackupReport, ChannelId, Envelope, ErrorPayload, MessageType, Peer, RegistrationPayload,
    StatusUpdate,
};
use gantry_state::{BackupStatus, ResourceSnapshot, epoch_secs};

use crate::ApiState;

// ── Agent endpoint ─────────────────────────────────────────────

/// GET /ws/agent
pub async fn agent_ws(State(state): State<ApiState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| handle_agent(state, socket))
}

async fn handle_agent(state: ApiState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    // The first text frame must be the registration envelope.
    let raw = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "agent socket failed before registration");
                return;
            }
        }
    };

    let reg = match parse_registration(raw.as_str()) {
        Ok(reg) => reg,
        Err(message) => {
            warn!(%message, "agent handshake rejected");
            send_direct(&mut sender, Envelope::error(message)).await;
            return;
        }
    };
    let node_id = reg.node_id.clone();

    if !state.hub.authenticate_node(&node_id, &reg.token) {
        warn!(%node_id, "agent presented an invalid token");
        send_direct(&mut sender, Envelope::error("invalid token")).await;
        return;
    }
    if let Err(e) = state.registry.connect(&node_id, reg.capabilities) {
        warn!(%node_id, error = %e, "agent connect rejected");
        send_direct(&mut sender, Envelope::error(e.to_string())).await;
        return;
    }

    let (channel_id, mut outbound) = state.hub.attach(Peer::Agent {
        node_id: node_id.clone(),
    });
    info!(%node_id, channel = channel_id, "agent connected");

    let pump = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let Ok(json) = envelope.to_json() else { continue };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match Envelope::from_json(text.as_str()) {
                Ok(envelope) => handle_agent_envelope(&state, channel_id, &node_id, envelope),
                Err(e) => debug!(%node_id, error = %e, "undecodable agent envelope dropped"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%node_id, error = %e, "agent socket error");
                break;
            }
        }
    }

    state.hub.detach(channel_id);
    if let Err(e) = state.registry.disconnect(&node_id) {
        debug!(%node_id, error = %e, "disconnect after socket close failed");
    }
    pump.abort();
    info!(%node_id, "agent disconnected");
}

/// Decode and validate the handshake frame.
fn parse_registration(raw: &str) -> Result<RegistrationPayload, String> {
    let envelope =
        Envelope::from_json(raw).map_err(|e| format!("bad registration envelope: {e}"))?;
    if envelope.kind != MessageType::NodeRegistration {
        return Err(format!(
            "expected node_registration, got {:?}",
            envelope.kind
        ));
    }
    envelope
        .payload()
        .map_err(|e| format!("bad registration payload: {e}"))
}

/// Apply one agent-sent envelope to control-plane state and fan out
/// server-scoped events to subscribers.
pub(crate) fn handle_agent_envelope(
    state: &ApiState,
    channel_id: ChannelId,
    node_id: &str,
    envelope: Envelope,
) {
    match envelope.kind {
        MessageType::ResourceUpdate => match envelope.payload::<ResourceSnapshot>() {
            Ok(snapshot) => {
                if let Err(e) = state.registry.update_resources(node_id, snapshot) {
                    warn!(%node_id, error = %e, "resource update failed");
                }
            }
            Err(e) => debug!(%node_id, error = %e, "bad resource_update payload"),
        },
        MessageType::ServerStatus => {
            if let Some(server_id) = envelope.server_id.clone() {
                apply_status_update(state, &server_id, &envelope);
                state.hub.broadcast_to_subscribers(&server_id, &envelope);
            }
        }
        MessageType::ConsoleLog
        | MessageType::ServerStats
        | MessageType::ServerDeployed
        | MessageType::ServerStopped => {
            if let Some(server_id) = &envelope.server_id {
                state.hub.broadcast_to_subscribers(server_id, &envelope);
            }
        }
        MessageType::BackupCompleted | MessageType::BackupFailed => {
            apply_backup_report(state, envelope.kind, &envelope);
            if let Some(server_id) = &envelope.server_id {
                state.hub.broadcast_to_subscribers(server_id, &envelope);
            }
        }
        MessageType::Ping => {
            let _ = state
                .hub
                .send_to(channel_id, Envelope::bare(MessageType::Pong));
        }
        MessageType::Pong => {}
        MessageType::Error => {
            if let Ok(payload) = envelope.payload::<ErrorPayload>() {
                warn!(%node_id, message = %payload.message, "agent reported an error");
            }
            if let Some(server_id) = &envelope.server_id {
                state.hub.broadcast_to_subscribers(server_id, &envelope);
            }
        }
        other => debug!(%node_id, kind = ?other, "unexpected agent message dropped"),
    }
}

fn apply_status_update(state: &ApiState, server_id: &str, envelope: &Envelope) {
    let update = match envelope.payload::<StatusUpdate>() {
        Ok(update) => update,
        Err(e) => {
            debug!(%server_id, error = %e, "bad server_status payload");
            return;
        }
    };
    match state.store.get_server(server_id) {
        Ok(Some(mut record)) => {
            record.status = update.status;
            record.pid = update.pid;
            if let Err(e) = state.store.put_server(&record) {
                warn!(%server_id, error = %e, "status write failed");
            }
        }
        Ok(None) => debug!(%server_id, "status for unknown server dropped"),
        Err(e) => warn!(%server_id, error = %e, "status lookup failed"),
    }
}

fn apply_backup_report(state: &ApiState, kind: MessageType, envelope: &Envelope) {
    let report = match envelope.payload::<BackupReport>() {
        Ok(report) => report,
        Err(e) => {
            debug!(error = %e, "bad backup report payload");
            return;
        }
    };
    let mut record = match state.store.get_backup(&report.backup_id) {
        Ok(Some(record)) => record,
        Ok(None) => {
            debug!(backup_id = %report.backup_id, "report for unknown backup dropped");
            return;
        }
        Err(e) => {
            warn!(backup_id = %report.backup_id, error = %e, "backup lookup failed");
            return;
        }
    };

    let succeeded = kind == MessageType::BackupCompleted;
    if record.status == BackupStatus::Restoring {
        // Restore outcome. The archive itself is unchanged either way,
        // so the record goes back to completed.
        if !succeeded {
            warn!(
                backup_id = %record.id,
                error = report.error.as_deref().unwrap_or("unknown"),
                "restore failed"
            );
        }
        record.status = BackupStatus::Completed;
    } else if succeeded {
        record.status = BackupStatus::Completed;
        record.archive_path = report.archive_path;
        record.size_bytes = report.size_bytes;
        record.sha256 = report.sha256;
        record.error = None;
        record.completed_at = Some(epoch_secs());
        stamp_last_backup(state, &record.server_id);
    } else {
        record.status = BackupStatus::Failed;
        record.error = report.error;
        record.completed_at = Some(epoch_secs());
    }

    if let Err(e) = state.store.put_backup(&record) {
        warn!(backup_id = %record.id, error = %e, "backup write failed");
    }
}

fn stamp_last_backup(state: &ApiState, server_id: &str) {
    if let Ok(Some(mut server)) = state.store.get_server(server_id) {
        server.last_backup_at = Some(epoch_secs());
        if let Err(e) = state.store.put_server(&server) {
            warn!(%server_id, error = %e, "last_backup_at write failed");
        }
    }
}

// ── Observer endpoint ──────────────────────────────────────────

/// Query parameters accepted by the observer endpoint.
#[derive(Deserialize)]
pub struct ObserverParams {
    pub identity: Option<String>,
}

/// GET /ws/observer
pub async fn observer_ws(
    State(state): State<ApiState>,
    Query(params): Query<ObserverParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let identity = params.identity.unwrap_or_else(|| "anonymous".to_string());
    upgrade.on_upgrade(move |socket| handle_observer(state, identity, socket))
}

async fn handle_observer(state: ApiState, identity: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (channel_id, mut outbound) = state.hub.attach(Peer::Observer {
        identity: identity.clone(),
    });
    info!(%identity, channel = channel_id, "observer connected");

    let pump = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let Ok(json) = envelope.to_json() else { continue };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match Envelope::from_json(text.as_str()) {
                Ok(envelope) => handle_observer_envelope(&state, channel_id, &identity, envelope),
                Err(e) => debug!(%identity, error = %e, "undecodable observer envelope dropped"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%identity, error = %e, "observer socket error");
                break;
            }
        }
    }

    state.hub.detach(channel_id);
    pump.abort();
    info!(%identity, "observer disconnected");
}

/// Apply one observer-sent envelope. Faults are reported back on the
/// observer's own channel, never broadcast.
pub(crate) fn handle_observer_envelope(
    state: &ApiState,
    channel_id: ChannelId,
    identity: &str,
    envelope: Envelope,
) {
    match envelope.kind {
        MessageType::SubscribeServer => {
            let Some(server_id) = envelope.server_id else {
                let _ = state.hub.send_to(
                    channel_id,
                    Envelope::error("subscribe_server requires a server_id"),
                );
                return;
            };
            let reply = match state.hub.subscribe(channel_id, &server_id) {
                Ok(()) => Envelope::bare(MessageType::SubscribeServer).with_server(&server_id),
                Err(e) => Envelope::error(e.to_string()).with_server(&server_id),
            };
            let _ = state.hub.send_to(channel_id, reply);
        }
        MessageType::UnsubscribeServer => {
            if let Some(server_id) = &envelope.server_id {
                let _ = state.hub.unsubscribe(channel_id, server_id);
            }
        }
        MessageType::SendCommand => forward_observer_command(state, channel_id, identity, envelope),
        MessageType::Ping => {
            let _ = state
                .hub
                .send_to(channel_id, Envelope::bare(MessageType::Pong));
        }
        other => debug!(%identity, kind = ?other, "unexpected observer message dropped"),
    }
}

/// Route an observer console command to the owning node's agent.
fn forward_observer_command(
    state: &ApiState,
    channel_id: ChannelId,
    identity: &str,
    envelope: Envelope,
) {
    let Some(server_id) = envelope.server_id.clone() else {
        let _ = state.hub.send_to(
            channel_id,
            Envelope::error("send_command requires a server_id"),
        );
        return;
    };
    if !state.hub.can_command(identity, &server_id) {
        let _ = state.hub.send_to(
            channel_id,
            Envelope::error("command denied").with_server(&server_id),
        );
        return;
    }
    let server = match state.store.get_server(&server_id) {
        Ok(Some(server)) => server,
        _ => {
            let _ = state.hub.send_to(
                channel_id,
                Envelope::error(format!("unknown server {server_id}")).with_server(&server_id),
            );
            return;
        }
    };
    match state.registry.get(&server.node_id) {
        Some(node) if node.is_online() => {}
        _ => {
            let _ = state.hub.send_to(
                channel_id,
                Envelope::error(format!("node {} is not online", server.node_id))
                    .with_server(&server_id),
            );
            return;
        }
    }
    if let Err(e) = state.hub.send_to_node(&server.node_id, envelope) {
        let _ = state.hub.send_to(
            channel_id,
            Envelope::error(e.to_string()).with_server(&server_id),
        );
    }
}

/// Send one envelope straight to the socket, outside any hub channel.
async fn send_direct(sender: &mut SplitSink<WebSocket, Message>, envelope: Envelope) {
    if let Ok(json) = envelope.to_json() {
        let _ = sender.send(Message::Text(json.into())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use gantry_bus::{AccessPolicy, AllowAll, BusHub, CommandPayload};
    use gantry_registry::{NodeRegistration, NodeRegistry};
    use gantry_state::{
        BackupRecord, ResourceLimits, ServerRecord, ServerStatus, StateStore,
    };
    use tokio::sync::mpsc;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        ApiState {
            store: store.clone(),
            registry: Arc::new(NodeRegistry::new(store).unwrap()),
            hub: Arc::new(BusHub::new(Box::new(AllowAll))),
            default_backup_exclude: Arc::new(Vec::new()),
        }
    }

    fn register_node(state: &ApiState, id: &str) {
        state
            .registry
            .register(NodeRegistration {
                id: id.to_string(),
                name: id.to_string(),
                location: "eu-west".to_string(),
                address: "10.0.0.1:7070".to_string(),
                capabilities: BTreeSet::new(),
            })
            .unwrap();
    }

    fn online_node(state: &ApiState, id: &str) -> (ChannelId, mpsc::UnboundedReceiver<Envelope>) {
        register_node(state, id);
        state.registry.connect(id, BTreeSet::new()).unwrap();
        state.hub.attach(Peer::Agent {
            node_id: id.to_string(),
        })
    }

    fn observer(state: &ApiState, name: &str) -> (ChannelId, mpsc::UnboundedReceiver<Envelope>) {
        state.hub.attach(Peer::Observer {
            identity: name.to_string(),
        })
    }

    fn seed_server(state: &ApiState, id: &str, node_id: &str, status: ServerStatus) {
        state
            .store
            .put_server(&ServerRecord {
                id: id.to_string(),
                node_id: node_id.to_string(),
                server_type: "minecraft-java".to_string(),
                version: "1.21".to_string(),
                port: 25565,
                limits: ResourceLimits {
                    memory_mb: 2048,
                    cpu_cores: 1,
                    disk_mb: 1000,
                },
                status,
                pid: None,
                auto_restart: true,
                last_backup_at: None,
                created_at: 0,
            })
            .unwrap();
    }

    fn seed_backup(state: &ApiState, id: &str, server_id: &str, status: BackupStatus) {
        state
            .store
            .put_backup(&BackupRecord {
                id: id.to_string(),
                server_id: server_id.to_string(),
                name: "nightly".to_string(),
                status,
                archive_path: Some("/data/backups/old.tar.gz".to_string()),
                size_bytes: 512,
                sha256: Some("cafe".to_string()),
                exclude_patterns: vec![],
                error: None,
                locked: false,
                started_at: 0,
                completed_at: None,
            })
            .unwrap();
    }

    fn snapshot(cpu: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_cores: 8,
            cpu_usage_percent: cpu,
            memory_total_mb: 16_000,
            memory_used_mb: 4_000,
            disk_total_mb: 100_000,
            disk_used_mb: 10_000,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
        }
    }

    #[test]
    fn registration_frame_parses() {
        let raw = r#"{
            "type": "node_registration",
            "data": {
                "node_id": "node-7",
                "name": "rack-7",
                "location": "us-east",
                "capabilities": ["java-runtime"],
                "token": "s3cret"
            },
            "timestamp": "2026-08-25T12:00:00Z"
        }"#;
        let reg = parse_registration(raw).unwrap();
        assert_eq!(reg.node_id, "node-7");
        assert_eq!(reg.token, "s3cret");
    }

    #[test]
    fn registration_frame_with_wrong_kind_is_rejected() {
        let raw = r#"{"type": "ping", "data": {}, "timestamp": "2026-08-25T12:00:00Z"}"#;
        let err = parse_registration(raw).unwrap_err();
        assert!(err.contains("expected node_registration"));

        assert!(parse_registration("not json").is_err());
    }

    #[tokio::test]
    async fn resource_update_lands_in_registry() {
        let state = test_state();
        let (channel_id, _rx) = online_node(&state, "node-1");

        let envelope = Envelope::new(MessageType::ResourceUpdate, &snapshot(40.0))
            .unwrap()
            .with_node("node-1");
        handle_agent_envelope(&state, channel_id, "node-1", envelope);

        let node = state.registry.get("node-1").unwrap();
        assert_eq!(node.resources.unwrap().cpu_usage_percent, 40.0);
    }

    #[tokio::test]
    async fn server_status_updates_record_and_reaches_subscribers() {
        let state = test_state();
        let (agent_channel, _agent_rx) = online_node(&state, "node-1");
        seed_server(&state, "srv-1", "node-1", ServerStatus::Starting);

        let (observer_channel, mut observer_rx) = observer(&state, "alice");
        state.hub.subscribe(observer_channel, "srv-1").unwrap();

        let envelope = Envelope::new(
            MessageType::ServerStatus,
            &StatusUpdate {
                status: ServerStatus::Running,
                pid: Some(42),
                reason: None,
            },
        )
        .unwrap()
        .with_server("srv-1")
        .with_node("node-1");
        handle_agent_envelope(&state, agent_channel, "node-1", envelope);

        let record = state.store.get_server("srv-1").unwrap().unwrap();
        assert_eq!(record.status, ServerStatus::Running);
        assert_eq!(record.pid, Some(42));

        let seen = observer_rx.try_recv().unwrap();
        assert_eq!(seen.kind, MessageType::ServerStatus);
    }

    #[tokio::test]
    async fn backup_completed_finalizes_record() {
        let state = test_state();
        let (channel_id, _rx) = online_node(&state, "node-1");
        seed_server(&state, "srv-1", "node-1", ServerStatus::Running);
        seed_backup(&state, "bak-1", "srv-1", BackupStatus::Creating);

        let report = BackupReport {
            backup_id: "bak-1".to_string(),
            archive_path: Some("/data/backups/bak-1.tar.gz".to_string()),
            size_bytes: 4096,
            sha256: Some("abc123".to_string()),
            error: None,
        };
        let envelope = Envelope::new(MessageType::BackupCompleted, &report)
            .unwrap()
            .with_server("srv-1")
            .with_node("node-1");
        handle_agent_envelope(&state, channel_id, "node-1", envelope);

        let record = state.store.get_backup("bak-1").unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.archive_path.as_deref(), Some("/data/backups/bak-1.tar.gz"));
        assert_eq!(record.size_bytes, 4096);
        assert!(record.completed_at.is_some());

        let server = state.store.get_server("srv-1").unwrap().unwrap();
        assert!(server.last_backup_at.is_some());
    }

    #[tokio::test]
    async fn backup_failed_records_the_reason() {
        let state = test_state();
        let (channel_id, _rx) = online_node(&state, "node-1");
        seed_server(&state, "srv-1", "node-1", ServerStatus::Running);
        seed_backup(&state, "bak-1", "srv-1", BackupStatus::Creating);

        let report = BackupReport {
            backup_id: "bak-1".to_string(),
            archive_path: None,
            size_bytes: 0,
            sha256: None,
            error: Some("disk full".to_string()),
        };
        let envelope = Envelope::new(MessageType::BackupFailed, &report)
            .unwrap()
            .with_server("srv-1");
        handle_agent_envelope(&state, channel_id, "node-1", envelope);

        let record = state.store.get_backup("bak-1").unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn restore_outcome_returns_record_to_completed() {
        let state = test_state();
        let (channel_id, _rx) = online_node(&state, "node-1");
        seed_server(&state, "srv-1", "node-1", ServerStatus::Stopped);
        seed_backup(&state, "bak-1", "srv-1", BackupStatus::Restoring);

        // Even a failed restore leaves the archive intact.
        let report = BackupReport {
            backup_id: "bak-1".to_string(),
            archive_path: None,
            size_bytes: 0,
            sha256: None,
            error: Some("checksum mismatch".to_string()),
        };
        let envelope = Envelope::new(MessageType::BackupFailed, &report)
            .unwrap()
            .with_server("srv-1");
        handle_agent_envelope(&state, channel_id, "node-1", envelope);

        let record = state.store.get_backup("bak-1").unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.archive_path.as_deref(), Some("/data/backups/old.tar.gz"));
    }

    #[tokio::test]
    async fn agent_ping_is_answered_on_its_channel() {
        let state = test_state();
        let (channel_id, mut rx) = online_node(&state, "node-1");

        handle_agent_envelope(&state, channel_id, "node-1", Envelope::bare(MessageType::Ping));
        assert_eq!(rx.try_recv().unwrap().kind, MessageType::Pong);
    }

    #[tokio::test]
    async fn observer_subscribes_and_receives_console_output() {
        let state = test_state();
        let (agent_channel, _agent_rx) = online_node(&state, "node-1");
        seed_server(&state, "srv-1", "node-1", ServerStatus::Running);
        let (observer_channel, mut observer_rx) = observer(&state, "alice");

        handle_observer_envelope(
            &state,
            observer_channel,
            "alice",
            Envelope::bare(MessageType::SubscribeServer).with_server("srv-1"),
        );
        let ack = observer_rx.try_recv().unwrap();
        assert_eq!(ack.kind, MessageType::SubscribeServer);

        let envelope = Envelope::bare(MessageType::ConsoleLog).with_server("srv-1");
        handle_agent_envelope(&state, agent_channel, "node-1", envelope);
        assert_eq!(observer_rx.try_recv().unwrap().kind, MessageType::ConsoleLog);
    }

    #[tokio::test]
    async fn subscription_denial_goes_to_the_caller_only() {
        struct DenyObservers;
        impl AccessPolicy for DenyObservers {
            fn authenticate_node(&self, _: &str, _: &str) -> bool {
                true
            }
            fn can_subscribe(&self, _: &str, _: &str) -> bool {
                false
            }
            fn can_command(&self, _: &str, _: &str) -> bool {
                false
            }
        }

        let store = StateStore::open_in_memory().unwrap();
        let state = ApiState {
            store: store.clone(),
            registry: Arc::new(NodeRegistry::new(store).unwrap()),
            hub: Arc::new(BusHub::new(Box::new(DenyObservers))),
            default_backup_exclude: Arc::new(Vec::new()),
        };
        let (mallory_channel, mut mallory_rx) = observer(&state, "mallory");
        let (_other_channel, mut other_rx) = observer(&state, "bob");

        handle_observer_envelope(
            &state,
            mallory_channel,
            "mallory",
            Envelope::bare(MessageType::SubscribeServer).with_server("srv-1"),
        );

        let reply = mallory_rx.try_recv().unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        assert!(other_rx.try_recv().is_err());
        assert_eq!(state.hub.subscriber_count("srv-1"), 0);
    }

    #[tokio::test]
    async fn observer_command_forwards_to_the_agent() {
        let state = test_state();
        let (_agent_channel, mut agent_rx) = online_node(&state, "node-1");
        seed_server(&state, "srv-1", "node-1", ServerStatus::Running);
        let (observer_channel, mut observer_rx) = observer(&state, "alice");

        let envelope = Envelope::new(
            MessageType::SendCommand,
            &CommandPayload {
                command: "save-all".to_string(),
            },
        )
        .unwrap()
        .with_server("srv-1");
        handle_observer_envelope(&state, observer_channel, "alice", envelope);

        let forwarded = agent_rx.try_recv().unwrap();
        assert_eq!(forwarded.kind, MessageType::SendCommand);
        let cmd: CommandPayload = forwarded.payload().unwrap();
        assert_eq!(cmd.command, "save-all");
        assert!(observer_rx.try_recv().is_err(), "no error should come back");
    }

    #[tokio::test]
    async fn observer_command_to_offline_node_reports_an_error() {
        let state = test_state();
        register_node(&state, "node-1");
        seed_server(&state, "srv-1", "node-1", ServerStatus::Running);
        let (observer_channel, mut observer_rx) = observer(&state, "alice");

        let envelope = Envelope::new(
            MessageType::SendCommand,
            &CommandPayload {
                command: "stop".to_string(),
            },
        )
        .unwrap()
        .with_server("srv-1");
        handle_observer_envelope(&state, observer_channel, "alice", envelope);

        let reply = observer_rx.try_recv().unwrap();
        assert_eq!(reply.kind, MessageType::Error);
    }
}
