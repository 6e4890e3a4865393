//! Autoscaler — interval evaluation of cluster means against targets.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use gantry_registry::NodeRegistry;
use gantry_state::epoch_secs;

/// Thresholds and bounds for scale decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleTargets {
    /// Mean CPU usage percent that triggers scale-out.
    pub cpu_percent: f64,
    /// Mean memory usage percent that triggers scale-out.
    pub memory_percent: f64,
    /// Never scale in below this many online nodes.
    pub min_nodes: usize,
    /// Never scale out above this many online nodes.
    pub max_nodes: usize,
    /// Quiet period after any decision, in seconds.
    pub cooldown_secs: u64,
}

impl Default for ScaleTargets {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 80.0,
            min_nodes: 1,
            max_nodes: 10,
            cooldown_secs: 300,
        }
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScaleDecision {
    /// The fleet should grow by one node.
    ScaleOut { reason: String },
    /// The fleet can shrink by one node.
    ScaleIn { reason: String },
    /// Load sits inside the band, or a cooldown is active.
    Hold,
}

/// Receives every non-hold decision. The control plane hooks the bus
/// broadcast and the provisioning call in here.
pub type ScaleCallback = Box<dyn Fn(&ScaleDecision) + Send + Sync>;

/// Evaluates cluster load on a fixed interval.
pub struct Autoscaler {
    registry: Arc<NodeRegistry>,
    targets: ScaleTargets,
    /// Epoch seconds of the last non-hold decision.
    last_decision_at: u64,
    on_decision: Option<ScaleCallback>,
}

impl Autoscaler {
    pub fn new(registry: Arc<NodeRegistry>, targets: ScaleTargets) -> Self {
        Self {
            registry,
            targets,
            last_decision_at: 0,
            on_decision: None,
        }
    }

    /// Set the callback invoked for every non-hold decision.
    pub fn with_decision_fn(mut self, f: ScaleCallback) -> Self {
        self.on_decision = Some(f);
        self
    }

    /// Evaluate cluster load at wall-clock time `now`.
    ///
    /// Means are computed over online nodes that have reported a snapshot;
    /// a cluster with no reporting nodes holds, since there is nothing to
    /// measure.
    pub fn evaluate(&mut self, now: u64) -> ScaleDecision {
        let online = self.registry.list_online();
        let snapshots: Vec<_> = online.iter().filter_map(|n| n.resources.as_ref()).collect();
        if snapshots.is_empty() {
            return ScaleDecision::Hold;
        }

        let count = online.len();
        let mean_cpu = snapshots.iter().map(|r| r.cpu_usage_percent).sum::<f64>()
            / snapshots.len() as f64;
        let mean_mem = snapshots
            .iter()
            .map(|r| r.memory_usage_percent())
            .sum::<f64>()
            / snapshots.len() as f64;

        let t = &self.targets;
        let cooled_down = now.saturating_sub(self.last_decision_at) >= t.cooldown_secs;

        if (mean_cpu > t.cpu_percent || mean_mem > t.memory_percent) && count < t.max_nodes {
            if !cooled_down {
                debug!(mean_cpu, mean_mem, "scale-out suppressed by cooldown");
                return ScaleDecision::Hold;
            }
            self.last_decision_at = now;
            return ScaleDecision::ScaleOut {
                reason: format!(
                    "mean cpu {mean_cpu:.1}% / mem {mean_mem:.1}% above target with {count} nodes online"
                ),
            };
        }

        if mean_cpu < t.cpu_percent / 2.0 && mean_mem < t.memory_percent / 2.0 && count > t.min_nodes
        {
            if !cooled_down {
                debug!(mean_cpu, mean_mem, "scale-in suppressed by cooldown");
                return ScaleDecision::Hold;
            }
            self.last_decision_at = now;
            return ScaleDecision::ScaleIn {
                reason: format!(
                    "mean cpu {mean_cpu:.1}% / mem {mean_mem:.1}% below half target with {count} nodes online"
                ),
            };
        }

        ScaleDecision::Hold
    }

    /// Evaluate once and dispatch any non-hold decision to the callback.
    pub fn tick(&mut self, now: u64) -> ScaleDecision {
        let decision = self.evaluate(now);
        if decision != ScaleDecision::Hold {
            info!(?decision, "scale decision");
            if let Some(f) = &self.on_decision {
                f(&decision);
            }
        }
        decision
    }

    /// Run the evaluation loop until the shutdown signal fires.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick(epoch_secs());
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}
