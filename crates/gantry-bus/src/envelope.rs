//! Wire envelope and typed payloads.
//!
//! Every bus message is a JSON object:
//!
//! ```json
//! {"type": "console_log", "server_id": "srv-1", "data": {...},
//!  "timestamp": "2026-08-25T12:00:00Z", "node_id": "node-1"}
//! ```
//!
//! `type` discriminates handling; `data` carries a message-specific payload
//! decoded on demand via [`Envelope::payload`]. Envelopes are stateless and
//! never persisted.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use gantry_state::{ResourceSnapshot, ServerStatus};

use crate::error::BusResult;

/// Message type discriminator, serialized in snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Agent → control plane
    NodeRegistration,
    ResourceUpdate,
    ServerDeployed,
    ServerStopped,
    ServerStatus,
    ServerStats,
    ConsoleLog,
    BackupCompleted,
    BackupFailed,
    // Control plane → agent
    DeployServer,
    StopServer,
    RestartServer,
    SendCommand,
    BackupServer,
    RestoreBackup,
    // Observer ↔ control plane
    SubscribeServer,
    UnsubscribeServer,
    // Cluster-wide events
    ClusterDegraded,
    ScaleDecision,
    // Keepalive and faults, any direction
    Ping,
    Pong,
    Error,
}

/// The unit of communication on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Target or subject server, for server-scoped messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Message-specific payload.
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Originating node, for agent-sent messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Envelope {
    /// Build an envelope with the current timestamp and the given payload.
    pub fn new<T: Serialize>(kind: MessageType, data: &T) -> BusResult<Self> {
        Ok(Self {
            kind,
            server_id: None,
            data: serde_json::to_value(data)?,
            timestamp: Utc::now(),
            node_id: None,
        })
    }

    /// Build a payload-less envelope (ping, pong, subscribe acknowledgments).
    pub fn bare(kind: MessageType) -> Self {
        Self {
            kind,
            server_id: None,
            data: serde_json::Value::Object(serde_json::Map::new()),
            timestamp: Utc::now(),
            node_id: None,
        }
    }

    /// An `error` envelope carrying a human-readable message.
    pub fn error(message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            message: message.into(),
            context: None,
        };
        // Serializing two plain strings cannot fail.
        Self::new(MessageType::Error, &payload).unwrap_or_else(|_| Self::bare(MessageType::Error))
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Decode the `data` field into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> BusResult<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn to_json(&self) -> BusResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> BusResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

// ── Payloads ───────────────────────────────────────────────────────

/// Agent handshake, the first message on every (re)connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationPayload {
    pub node_id: String,
    pub name: String,
    pub location: String,
    pub capabilities: BTreeSet<String>,
    /// Bearer token; checked by the control plane's access policy.
    pub token: String,
}

/// Instruction to deploy one server process, sent with `deploy_server`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploySpec {
    pub server_id: String,
    pub server_type: String,
    pub version: String,
    pub port: u16,
    pub memory_mb: u64,
    /// Runnable artifact source: `file://…` or `http(s)://…`. Staged into
    /// the server's working directory before first start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub auto_restart: bool,
    /// Console line that asks the server to shut down gracefully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_line: Option<String>,
}

/// Lifecycle transition reported with `server_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: ServerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Required for transitions to `crashed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One line of process output, sent with `console_log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLine {
    /// "stdout" or "stderr".
    pub stream: String,
    pub line: String,
}

/// Per-process resource usage, sent with `server_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Console command forwarded to a server's stdin via `send_command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
}

/// Backup request sent with `backup_server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    pub backup_id: String,
    pub name: String,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// Restore request sent with `restore_backup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub backup_id: String,
    pub archive_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Outcome reported with `backup_completed` / `backup_failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReport {
    pub backup_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fault report, sent with `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Convenience constructor for the periodic resource report.
pub fn resource_update(node_id: &str, snapshot: &ResourceSnapshot) -> BusResult<Envelope> {
    Ok(Envelope::new(MessageType::ResourceUpdate, snapshot)?.with_node(node_id))
}
