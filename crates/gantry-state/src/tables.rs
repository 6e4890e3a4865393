//! redb table definitions for the Gantry state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Nodes, servers, and backups are all keyed by their record id.

use redb::TableDefinition;

/// Node records keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Server process records keyed by `{server_id}`.
pub const SERVERS: TableDefinition<&str, &[u8]> = TableDefinition::new("servers");

/// Backup records keyed by `{backup_id}`.
pub const BACKUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("backups");
