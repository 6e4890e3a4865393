//! Domain types for the Gantry state store.
//!
//! These types represent the persisted state of nodes, server processes,
//! and backups. All types are serializable to/from JSON for storage in
//! redb tables.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker node.
pub type NodeId = String;

/// Unique identifier for a server process record.
pub type ServerId = String;

/// Unique identifier for a backup record.
pub type BackupId = String;

// ── Resource snapshot ──────────────────────────────────────────────

/// Point-in-time resource report from a node.
///
/// Replaced wholesale on every report; individual fields are never
/// mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_cores: u32,
    /// Aggregate CPU usage across all cores, 0.0–100.0.
    pub cpu_usage_percent: f64,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub disk_total_mb: u64,
    pub disk_used_mb: u64,
    /// Cumulative bytes received across interfaces.
    pub network_rx_bytes: u64,
    /// Cumulative bytes transmitted across interfaces.
    pub network_tx_bytes: u64,
}

impl ResourceSnapshot {
    /// Memory usage as a percentage of total.
    pub fn memory_usage_percent(&self) -> f64 {
        if self.memory_total_mb == 0 {
            return 0.0;
        }
        self.memory_used_mb as f64 / self.memory_total_mb as f64 * 100.0
    }

    /// Unused CPU expressed in whole-core equivalents.
    pub fn free_cpu_cores(&self) -> f64 {
        self.cpu_cores as f64 * (100.0 - self.cpu_usage_percent) / 100.0
    }

    pub fn free_memory_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_used_mb)
    }

    pub fn free_disk_mb(&self) -> u64 {
        self.disk_total_mb.saturating_sub(self.disk_used_mb)
    }

    /// Load score used for placement: mean of CPU and memory usage percent.
    /// Lower is less loaded.
    pub fn load_score(&self) -> f64 {
        (self.cpu_usage_percent + self.memory_usage_percent()) / 2.0
    }
}

// ── Node ───────────────────────────────────────────────────────────

/// Lifecycle status of a node.
///
/// `offline → connecting → online → {draining, maintenance} → offline`;
/// the health monitor moves `online → failed`; a successful reconnect
/// moves `failed → online`. Neither `offline` nor `failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Offline,
    Connecting,
    Online,
    Draining,
    Maintenance,
    Failed,
}

impl NodeStatus {
    /// Whether the administrative transition `self → next` is allowed.
    ///
    /// `connect()` and `disconnect()` bypass this check; it guards the
    /// operator-driven transitions (drain, maintenance) and the health
    /// monitor's demotion to `failed`.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        match (self, next) {
            // Any state may begin a reconnect attempt.
            (_, Connecting) => true,
            (Connecting, Online) => true,
            (Connecting, Offline) => true,
            (Online, Draining) | (Online, Maintenance) => true,
            (Online, Failed) => true,
            (Online, Offline) => true,
            (Draining, Offline) | (Maintenance, Offline) => true,
            (Failed, Online) => true,
            _ => false,
        }
    }
}

/// A registered worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    /// Geographic/location tag, e.g. "eu-west".
    pub location: String,
    /// Network address of the node agent, host:port.
    pub address: String,
    /// Declared runtime capabilities, e.g. "java-runtime".
    pub capabilities: BTreeSet<String>,
    /// Most recent resource report, absent until the first one arrives.
    pub resources: Option<ResourceSnapshot>,
    pub status: NodeStatus,
    /// Unix timestamp (seconds) of registration.
    pub registered_at: u64,
    /// Unix timestamp (seconds) of the last report or reconnect.
    pub last_seen: u64,
}

impl NodeRecord {
    /// Whether this node currently accepts placement and server commands.
    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }
}

// ── Server process ─────────────────────────────────────────────────

/// Lifecycle status of a supervised game-server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// Resource limits granted to one server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: u32,
    pub disk_mb: u64,
}

/// One game-server instance placed on a node.
///
/// The record, not the OS process, is the durable identity: the process
/// may be replaced across restarts while the record persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    /// Owning node, by id. Lookups go through the registry.
    pub node_id: NodeId,
    /// Declared workload type, e.g. "minecraft-java".
    pub server_type: String,
    pub version: String,
    /// Assigned listen port on the node.
    pub port: u16,
    pub limits: ResourceLimits,
    pub status: ServerStatus,
    /// OS process id while running.
    pub pid: Option<u32>,
    /// Restart automatically after a crash.
    pub auto_restart: bool,
    /// Unix timestamp of the last completed backup.
    pub last_backup_at: Option<u64>,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: u64,
}

// ── Backup ─────────────────────────────────────────────────────────

/// Lifecycle status of a backup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Creating,
    Completed,
    Failed,
    Restoring,
}

/// A point-in-time snapshot of a server's working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: BackupId,
    pub server_id: ServerId,
    /// Human-readable name chosen at request time.
    pub name: String,
    pub status: BackupStatus,
    /// Path of the finished archive on the owning node.
    pub archive_path: Option<String>,
    pub size_bytes: u64,
    /// Hex sha-256 of the finished archive.
    pub sha256: Option<String>,
    /// Relative-path patterns skipped during creation.
    pub exclude_patterns: Vec<String>,
    /// Failure reason when status is `failed`.
    pub error: Option<String>,
    /// Locked records cannot be deleted.
    pub locked: bool,
    /// Unix timestamp (seconds) when the backup was requested.
    pub started_at: u64,
    /// Unix timestamp (seconds) of completion or failure.
    pub completed_at: Option<u64>,
}

impl BackupRecord {
    /// An in-progress backup is being created or restored right now.
    pub fn in_progress(&self) -> bool {
        matches!(self.status, BackupStatus::Creating | BackupStatus::Restoring)
    }

    /// Deletion is allowed only for unlocked records that are not in progress.
    pub fn deletable(&self) -> bool {
        !self.locked && !self.in_progress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cpu: f64, mem_used: u64) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_cores: 8,
            cpu_usage_percent: cpu,
            memory_total_mb: 16_000,
            memory_used_mb: mem_used,
            disk_total_mb: 100_000,
            disk_used_mb: 20_000,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
        }
    }

    #[test]
    fn free_resources_derive_from_snapshot() {
        let snap = snapshot(50.0, 4_000);
        assert_eq!(snap.free_cpu_cores(), 4.0);
        assert_eq!(snap.free_memory_mb(), 12_000);
        assert_eq!(snap.free_disk_mb(), 80_000);
        assert_eq!(snap.memory_usage_percent(), 25.0);
    }

    #[test]
    fn load_score_is_mean_of_cpu_and_memory() {
        let snap = snapshot(60.0, 8_000); // 60% cpu, 50% mem
        assert_eq!(snap.load_score(), 55.0);
    }

    #[test]
    fn zero_memory_total_does_not_divide_by_zero() {
        let mut snap = snapshot(10.0, 0);
        snap.memory_total_mb = 0;
        assert_eq!(snap.memory_usage_percent(), 0.0);
    }

    #[test]
    fn node_status_transitions() {
        use NodeStatus::*;
        assert!(Offline.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Online));
        assert!(Online.can_transition_to(Draining));
        assert!(Online.can_transition_to(Maintenance));
        assert!(Online.can_transition_to(Failed));
        assert!(Draining.can_transition_to(Offline));
        assert!(Failed.can_transition_to(Online));
        assert!(Failed.can_transition_to(Connecting));

        // Disallowed jumps.
        assert!(!Offline.can_transition_to(Draining));
        assert!(!Offline.can_transition_to(Failed));
        assert!(!Draining.can_transition_to(Online));
        assert!(!Failed.can_transition_to(Maintenance));
    }

    #[test]
    fn status_enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&NodeStatus::Maintenance).unwrap(),
            "\"maintenance\""
        );
        assert_eq!(
            serde_json::to_string(&ServerStatus::Crashed).unwrap(),
            "\"crashed\""
        );
        assert_eq!(
            serde_json::to_string(&BackupStatus::Restoring).unwrap(),
            "\"restoring\""
        );
    }

    #[test]
    fn backup_deletability() {
        let mut backup = BackupRecord {
            id: "bak-1".to_string(),
            server_id: "srv-1".to_string(),
            name: "nightly".to_string(),
            status: BackupStatus::Completed,
            archive_path: None,
            size_bytes: 0,
            sha256: None,
            exclude_patterns: vec![],
            error: None,
            locked: false,
            started_at: 1000,
            completed_at: Some(1010),
        };
        assert!(backup.deletable());

        backup.locked = true;
        assert!(!backup.deletable());

        backup.locked = false;
        backup.status = BackupStatus::Restoring;
        assert!(backup.in_progress());
        assert!(!backup.deletable());
    }
}
