//! Health monitor — periodic registry sweeps.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use gantry_registry::NodeRegistry;
use gantry_state::{NodeRecord, NodeStatus, epoch_secs};

/// Called once per node demoted to `failed`. The control plane hooks the
/// degraded-cluster broadcast in here.
pub type DegradedCallback = Box<dyn Fn(&NodeRecord) + Send + Sync>;

/// Demotes silent nodes on a fixed interval.
///
/// A node is considered lost when `now − last_seen` exceeds twice the
/// sweep interval; agents report every few seconds, so a node that
/// misses two full sweeps is genuinely gone, not just slow.
pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    interval: Duration,
    on_degraded: Option<DegradedCallback>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<NodeRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            on_degraded: None,
        }
    }

    /// Set the callback invoked for every demoted node.
    pub fn with_degraded_fn(mut self, f: DegradedCallback) -> Self {
        self.on_degraded = Some(f);
        self
    }

    /// One sweep over the registry at wall-clock time `now`.
    ///
    /// Returns the nodes demoted during this sweep. Only `online` nodes
    /// are examined; a node already `failed` stays failed until its agent
    /// reconnects, so repeated sweeps never flap.
    pub fn sweep(&self, now: u64) -> Vec<NodeRecord> {
        let window = 2 * self.interval.as_secs();
        let mut demoted = Vec::new();

        for node in self.registry.list_online() {
            let silence = now.saturating_sub(node.last_seen);
            if silence <= window {
                continue;
            }

            // The node may have legitimately gone offline between the
            // list and this transition; skip it if so.
            match self.registry.set_status(&node.id, NodeStatus::Failed) {
                Ok(()) => {
                    warn!(
                        node_id = %node.id,
                        silence_secs = silence,
                        window_secs = window,
                        reason = "missed heartbeats",
                        "node demoted to failed"
                    );
                    if let Some(f) = &self.on_degraded {
                        f(&node);
                    }
                    demoted.push(node);
                }
                Err(e) => debug!(node_id = %node.id, error = %e, "demotion skipped"),
            }
        }

        demoted
    }

    /// Run the sweep loop until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "health monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep(epoch_secs());
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }
}
