//! BusHub — the control plane's registry of live bus channels.
//!
//! One channel per connected party. Transport handlers attach a channel,
//! pump envelopes out of the returned receiver onto the socket, and detach
//! on close. Delivery of server-scoped events is subscription-filtered:
//! only channels that subscribed to a server id receive its events.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::{BusError, BusResult};
use crate::policy::AccessPolicy;

/// Hub-assigned identifier for one live channel.
pub type ChannelId = u64;

/// Who sits on the other end of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Agent { node_id: String },
    Observer { identity: String },
}

struct Channel {
    peer: Peer,
    sender: mpsc::UnboundedSender<Envelope>,
    subscriptions: HashSet<String>,
}

/// Process-wide channel registry.
///
/// Created once at startup and drained at shutdown. Operations lock a
/// single reader/writer lock; all are short and non-blocking, and sends
/// go through unbounded channels so no subscriber can stall another.
pub struct BusHub {
    channels: RwLock<HashMap<ChannelId, Channel>>,
    policy: Box<dyn AccessPolicy>,
    next_id: AtomicU64,
}

impl BusHub {
    pub fn new(policy: Box<dyn AccessPolicy>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            policy,
            next_id: AtomicU64::new(1),
        }
    }

    /// Validate an agent handshake token against the access policy.
    pub fn authenticate_node(&self, node_id: &str, token: &str) -> bool {
        self.policy.authenticate_node(node_id, token)
    }

    /// May `identity` send console commands to `server_id`?
    pub fn can_command(&self, identity: &str, server_id: &str) -> bool {
        self.policy.can_command(identity, server_id)
    }

    /// Register a new channel and hand back its outbound receiver.
    ///
    /// The caller owns the receiver; dropping it closes the channel and a
    /// later send prunes the entry.
    pub fn attach(&self, peer: Peer) -> (ChannelId, mpsc::UnboundedReceiver<Envelope>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.write().unwrap();
        channels.insert(
            id,
            Channel {
                peer: peer.clone(),
                sender: tx,
                subscriptions: HashSet::new(),
            },
        );
        debug!(channel = id, ?peer, "bus channel attached");
        (id, rx)
    }

    /// Remove a channel, dropping all of its subscriptions.
    pub fn detach(&self, id: ChannelId) -> Option<Peer> {
        let mut channels = self.channels.write().unwrap();
        let removed = channels.remove(&id).map(|c| c.peer);
        if let Some(peer) = &removed {
            debug!(channel = id, ?peer, "bus channel detached");
        }
        removed
    }

    /// Subscribe a channel to a server's event stream.
    ///
    /// Observer subscriptions go through the access policy; a denial is
    /// reported only to the caller, never broadcast.
    pub fn subscribe(&self, id: ChannelId, server_id: &str) -> BusResult<()> {
        let mut channels = self.channels.write().unwrap();
        let channel = channels.get_mut(&id).ok_or(BusError::UnknownChannel(id))?;

        if let Peer::Observer { identity } = &channel.peer
            && !self.policy.can_subscribe(identity, server_id)
        {
            return Err(BusError::SubscriptionDenied {
                identity: identity.clone(),
                server_id: server_id.to_string(),
            });
        }

        channel.subscriptions.insert(server_id.to_string());
        debug!(channel = id, %server_id, "subscribed");
        Ok(())
    }

    /// Drop one subscription from a channel.
    pub fn unsubscribe(&self, id: ChannelId, server_id: &str) -> BusResult<()> {
        let mut channels = self.channels.write().unwrap();
        let channel = channels.get_mut(&id).ok_or(BusError::UnknownChannel(id))?;
        channel.subscriptions.remove(server_id);
        Ok(())
    }

    /// Deliver an envelope to every channel subscribed to `server_id`.
    ///
    /// Returns the number of channels reached. Channels whose receiver has
    /// gone away are pruned.
    pub fn broadcast_to_subscribers(&self, server_id: &str, envelope: &Envelope) -> usize {
        self.broadcast_where(envelope, |c| c.subscriptions.contains(server_id))
    }

    /// Deliver an envelope to every connected channel. Used for genuinely
    /// cluster-wide events (degradation, scale decisions), never for
    /// server-scoped ones.
    pub fn broadcast_all(&self, envelope: &Envelope) -> usize {
        self.broadcast_where(envelope, |_| true)
    }

    fn broadcast_where<F>(&self, envelope: &Envelope, select: F) -> usize
    where
        F: Fn(&Channel) -> bool,
    {
        let mut dead = Vec::new();
        let delivered = {
            let channels = self.channels.read().unwrap();
            let mut delivered = 0;
            for (id, channel) in channels.iter() {
                if !select(channel) {
                    continue;
                }
                if channel.sender.send(envelope.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
            delivered
        };

        if !dead.is_empty() {
            let mut channels = self.channels.write().unwrap();
            for id in dead {
                channels.remove(&id);
                warn!(channel = id, "pruned closed bus channel");
            }
        }

        delivered
    }

    /// Send an envelope to one specific channel.
    pub fn send_to(&self, id: ChannelId, envelope: Envelope) -> BusResult<()> {
        let channels = self.channels.read().unwrap();
        let channel = channels.get(&id).ok_or(BusError::UnknownChannel(id))?;
        channel
            .sender
            .send(envelope)
            .map_err(|_| BusError::ChannelClosed(id))
    }

    /// Send an envelope to the agent channel of a node.
    pub fn send_to_node(&self, node_id: &str, envelope: Envelope) -> BusResult<()> {
        let channels = self.channels.read().unwrap();
        let channel = channels
            .values()
            .find(|c| matches!(&c.peer, Peer::Agent { node_id: n } if n == node_id))
            .ok_or_else(|| BusError::NodeNotConnected(node_id.to_string()))?;
        channel
            .sender
            .send(envelope)
            .map_err(|_| BusError::NodeNotConnected(node_id.to_string()))
    }

    /// Whether an agent channel exists for this node.
    pub fn node_connected(&self, node_id: &str) -> bool {
        let channels = self.channels.read().unwrap();
        channels
            .values()
            .any(|c| matches!(&c.peer, Peer::Agent { node_id: n } if n == node_id))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap().len()
    }

    /// Number of channels subscribed to a server.
    pub fn subscriber_count(&self, server_id: &str) -> usize {
        let channels = self.channels.read().unwrap();
        channels
            .values()
            .filter(|c| c.subscriptions.contains(server_id))
            .count()
    }

    /// Close every channel. Senders are dropped, so each transport handler
    /// sees its receiver end and shuts the socket down.
    pub fn drain(&self) -> usize {
        let mut channels = self.channels.write().unwrap();
        let count = channels.len();
        channels.clear();
        debug!(count, "bus hub drained");
        count
    }
}
