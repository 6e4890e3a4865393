//! Error types for the node registry.

use gantry_state::{NodeStatus, StateError};
use thiserror::Error;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node {0} is already registered")]
    DuplicateNode(String),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("node {node_id} cannot transition {from:?} -> {to:?}")]
    InvalidTransition {
        node_id: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
