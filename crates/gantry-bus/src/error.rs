//! Error types for the bus.

use thiserror::Error;

/// Errors from bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unknown channel {0}")]
    UnknownChannel(u64),

    #[error("channel {0} is closed")]
    ChannelClosed(u64),

    #[error("node {0} has no connected channel")]
    NodeNotConnected(String),

    #[error("subscription to {server_id} denied for {identity}")]
    SubscriptionDenied {
        identity: String,
        server_id: String,
    },
}

/// Result alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;
