//! gantry-state — embedded state store for Gantry.
//!
//! Backed by [redb](https://docs.rs/redb), holds the durable records the
//! control plane owns: nodes, server processes, and backups. All domain
//! types are JSON-serialized into redb's `&[u8]` value columns.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as Unix seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generate a fresh record ID with a readable prefix, e.g. `srv-…`, `bak-…`.
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}
