//! Node registry — registration, connection lifecycle, resource tracking.
//!
//! Nodes are created through explicit registration, flip between statuses
//! as their agents connect and disconnect, and are removed only through
//! explicit deregistration. Every mutation writes through to the state
//! store so the fleet survives a control-plane restart.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gantry_state::{NodeId, NodeRecord, NodeStatus, ResourceSnapshot, StateStore, epoch_secs};

use crate::error::{RegistryError, RegistryResult};

/// Registration request for a new node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub id: NodeId,
    pub name: String,
    pub location: String,
    pub address: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

/// The authoritative map of known nodes.
///
/// All reads copy records out under a shared lock; mutations take the
/// exclusive lock, apply the change, and write through to the store.
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, NodeRecord>>,
    store: StateStore,
}

impl NodeRegistry {
    /// Build a registry on top of the store, reloading any persisted nodes.
    ///
    /// Reloaded nodes come back as `offline`: live channels cannot survive
    /// a control-plane restart, so agents re-handshake to get back online.
    pub fn new(store: StateStore) -> RegistryResult<Self> {
        let mut nodes = HashMap::new();
        for mut node in store.list_nodes()? {
            node.status = NodeStatus::Offline;
            nodes.insert(node.id.clone(), node);
        }
        if !nodes.is_empty() {
            info!(count = nodes.len(), "node registry restored from store");
        }
        Ok(Self {
            nodes: RwLock::new(nodes),
            store,
        })
    }

    /// Register a new node. Fails with `DuplicateNode` if the id is taken.
    pub fn register(&self, reg: NodeRegistration) -> RegistryResult<NodeRecord> {
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(&reg.id) {
            return Err(RegistryError::DuplicateNode(reg.id));
        }

        let now = epoch_secs();
        let node = NodeRecord {
            id: reg.id,
            name: reg.name,
            location: reg.location,
            address: reg.address,
            capabilities: reg.capabilities,
            resources: None,
            status: NodeStatus::Offline,
            registered_at: now,
            last_seen: now,
        };
        self.store.put_node(&node)?;
        info!(node_id = %node.id, location = %node.location, "node registered");
        nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    /// Mark a node online after a successful agent handshake.
    ///
    /// Valid from any state: this is the explicit recovery path out of
    /// `offline` and `failed`. Refreshes `last_seen` and the declared
    /// capability set (agents re-probe on startup).
    pub fn connect(
        &self,
        node_id: &str,
        capabilities: BTreeSet<String>,
    ) -> RegistryResult<NodeRecord> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;

        let previous = node.status;
        node.status = NodeStatus::Online;
        node.capabilities = capabilities;
        node.last_seen = epoch_secs();
        self.store.put_node(node)?;
        info!(%node_id, ?previous, "node connected");
        Ok(node.clone())
    }

    /// Mark a node offline after its channel closed.
    pub fn disconnect(&self, node_id: &str) -> RegistryResult<()> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;

        // A node the health monitor already demoted stays failed until it
        // reconnects; its channel closing is not news.
        if node.status != NodeStatus::Failed {
            node.status = NodeStatus::Offline;
        }
        self.store.put_node(node)?;
        info!(%node_id, "node disconnected");
        Ok(())
    }

    /// Replace a node's resource snapshot and refresh `last_seen`.
    ///
    /// A report from an unknown node is dropped, not an error: the agent
    /// may simply have outlived its registration.
    pub fn update_resources(&self, node_id: &str, snapshot: ResourceSnapshot) -> RegistryResult<()> {
        let mut nodes = self.nodes.write().unwrap();
        let Some(node) = nodes.get_mut(node_id) else {
            warn!(%node_id, "resource report from unknown node dropped");
            return Ok(());
        };

        node.resources = Some(snapshot);
        node.last_seen = epoch_secs();
        self.store.put_node(node)?;
        debug!(%node_id, "resource snapshot updated");
        Ok(())
    }

    /// Apply an administrative status transition (drain, maintenance,
    /// health-monitor demotion). Validated against the status machine.
    pub fn set_status(&self, node_id: &str, status: NodeStatus) -> RegistryResult<()> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;

        if !node.status.can_transition_to(status) {
            return Err(RegistryError::InvalidTransition {
                node_id: node_id.to_string(),
                from: node.status,
                to: status,
            });
        }

        node.status = status;
        self.store.put_node(node)?;
        info!(%node_id, ?status, "node status changed");
        Ok(())
    }

    /// Copy out a single node.
    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.read().unwrap().get(node_id).cloned()
    }

    /// Copy out every known node.
    pub fn list(&self) -> Vec<NodeRecord> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    /// Copy out the nodes currently accepting placements and commands.
    pub fn list_online(&self) -> Vec<NodeRecord> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .filter(|n| n.is_online())
            .cloned()
            .collect()
    }

    /// Remove a node entirely. The only way a node record is deleted.
    pub fn deregister(&self, node_id: &str) -> RegistryResult<NodeRecord> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .remove(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
        self.store.delete_node(node_id)?;
        info!(%node_id, "node deregistered");
        Ok(node)
    }

    pub fn count(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn online_count(&self) -> usize {
        self.nodes
            .read()
            .unwrap()
            .values()
            .filter(|n| n.is_online())
            .count()
    }
}
