//! Opaque access-policy seam.
//!
//! Identity and authorization live outside this core; the bus consumes them
//! through this trait. The control plane checks agent handshake tokens and
//! observer subscribe/command permissions here and nowhere else.

/// Permission checks consulted by the hub and the WebSocket handlers.
pub trait AccessPolicy: Send + Sync {
    /// Validate an agent's handshake bearer token.
    fn authenticate_node(&self, node_id: &str, token: &str) -> bool;

    /// May `identity` subscribe to `server_id`'s event stream?
    fn can_subscribe(&self, identity: &str, server_id: &str) -> bool;

    /// May `identity` send console commands to `server_id`?
    fn can_command(&self, identity: &str, server_id: &str) -> bool;
}

/// Permits everything. Development and tests only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn authenticate_node(&self, _node_id: &str, _token: &str) -> bool {
        true
    }

    fn can_subscribe(&self, _identity: &str, _server_id: &str) -> bool {
        true
    }

    fn can_command(&self, _identity: &str, _server_id: &str) -> bool {
        true
    }
}

/// Shared-secret policy: agents must present the expected token; observers
/// that got past the transport are permitted everything.
#[derive(Debug, Clone)]
pub struct SharedToken {
    token: String,
}

impl SharedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AccessPolicy for SharedToken {
    fn authenticate_node(&self, _node_id: &str, token: &str) -> bool {
        token == self.token
    }

    fn can_subscribe(&self, _identity: &str, _server_id: &str) -> bool {
        true
    }

    fn can_command(&self, _identity: &str, _server_id: &str) -> bool {
        true
    }
}
