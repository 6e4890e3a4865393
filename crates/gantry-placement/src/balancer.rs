//! Node selection — requirement filtering plus least-loaded scoring.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use gantry_state::NodeRecord;

use crate::error::{PlacementError, PlacementResult};

/// Resource and capability floor a candidate node must clear.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    /// Minimum free CPU in whole-core equivalents.
    pub min_cpu_cores: f64,
    /// Minimum free memory in MB.
    pub min_memory_mb: u64,
    /// Minimum free disk in MB.
    pub min_disk_mb: u64,
    /// Capabilities the node must declare (subset test).
    pub capabilities: BTreeSet<String>,
    /// Location tag consulted by the geographic strategy.
    pub preferred_location: Option<String>,
}

/// Selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Lowest mean of CPU and memory usage percent wins.
    #[default]
    LeastLoaded,
    /// Restrict to the preferred location first, then least-loaded.
    Geographic,
}

/// Hard filter: online, declares every required capability, and has
/// reported a snapshot clearing the free-resource floors. Nodes that
/// have never reported resources are not candidates.
fn satisfies(node: &NodeRecord, req: &Requirements) -> bool {
    if !node.is_online() {
        return false;
    }
    if !req.capabilities.is_subset(&node.capabilities) {
        return false;
    }
    let Some(res) = &node.resources else {
        return false;
    };
    res.free_cpu_cores() >= req.min_cpu_cores
        && res.free_memory_mb() >= req.min_memory_mb
        && res.free_disk_mb() >= req.min_disk_mb
}

/// Least-loaded winner. Ties go to the lexicographically smaller node id
/// so repeated calls over the same inputs pick the same node.
fn least_loaded<'a>(candidates: &[&'a NodeRecord]) -> Option<&'a NodeRecord> {
    candidates.iter().copied().min_by(|a, b| {
        let score_a = a.resources.as_ref().map_or(f64::MAX, |r| r.load_score());
        let score_b = b.resources.as_ref().map_or(f64::MAX, |r| r.load_score());
        score_a
            .partial_cmp(&score_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Select the node a new workload should land on.
///
/// Re-evaluated from scratch on every call; resource snapshots change
/// continuously, so there is no cached "best node".
pub fn select_node<'a>(
    nodes: &'a [NodeRecord],
    req: &Requirements,
    strategy: Strategy,
) -> PlacementResult<&'a NodeRecord> {
    let candidates: Vec<&NodeRecord> = nodes.iter().filter(|n| satisfies(n, req)).collect();
    if candidates.is_empty() {
        return Err(PlacementError::NoSuitableNode);
    }

    let chosen = match strategy {
        Strategy::LeastLoaded => least_loaded(&candidates),
        Strategy::Geographic => {
            let local: Vec<&NodeRecord> = req
                .preferred_location
                .as_deref()
                .map(|loc| {
                    candidates
                        .iter()
                        .copied()
                        .filter(|n| n.location == loc)
                        .collect()
                })
                .unwrap_or_default();
            if local.is_empty() {
                least_loaded(&candidates)
            } else {
                least_loaded(&local)
            }
        }
    };

    let node = chosen.ok_or(PlacementError::NoSuitableNode)?;
    debug!(
        node_id = %node.id,
        ?strategy,
        candidates = candidates.len(),
        "placement selected node"
    );
    Ok(node)
}
