//! Unneeded-node selection for scale-down.
//!
//! A node becomes a candidate once its utilization has stayed below the
//! configured threshold for the unneeded duration and its pods fit into the
//! spare capacity of the nodes that would remain.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use gridscale_core::{NodeRecord, PodSpec};

use crate::planner::FreeCapacity;

/// Requested share of the node's allocatable, the larger of the CPU and
/// memory dimensions. A node with nothing allocatable is never a candidate.
pub fn node_utilization(node: &NodeRecord, pods: &[PodSpec]) -> f64 {
    let cpu_requested: u64 = pods.iter().map(|p| p.requests.cpu_millis).sum();
    let memory_requested: u64 = pods.iter().map(|p| p.requests.memory_bytes).sum();

    let cpu = ratio(cpu_requested, node.allocatable.cpu_millis);
    let memory = ratio(memory_requested, node.allocatable.memory_bytes);
    cpu.max(memory)
}

fn ratio(requested: u64, allocatable: u64) -> f64 {
    if allocatable == 0 {
        return 1.0;
    }
    requested as f64 / allocatable as f64
}

/// Remembers how long each node has stayed below the utilization threshold.
#[derive(Debug, Default)]
pub struct UnneededTracker {
    below_since: HashMap<String, Instant>,
}

impl UnneededTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation for a node.
    pub fn observe(&mut self, node: &str, below_threshold: bool, now: Instant) {
        if below_threshold {
            self.below_since.entry(node.to_string()).or_insert(now);
        } else {
            self.below_since.remove(node);
        }
    }

    /// Nodes continuously below threshold for at least `unneeded_time`.
    pub fn unneeded(&self, unneeded_time: Duration, now: Instant) -> Vec<String> {
        let mut names: Vec<String> = self
            .below_since
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= unneeded_time)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drop state for a node that was deleted or disappeared.
    pub fn forget(&mut self, node: &str) {
        self.below_since.remove(node);
    }

    /// Keep only nodes still present in the cluster.
    pub fn retain_nodes(&mut self, names: &[&str]) {
        self.below_since.retain(|name, _| names.contains(&name.as_str()));
    }
}

/// Whether every pod of a drained node fits into the remaining headroom.
/// Deducts from `headroom` as it places, so callers can evaluate several
/// candidate nodes in sequence against one shared budget.
pub fn pods_fit_elsewhere(pods: &[PodSpec], headroom: &mut [FreeCapacity]) -> bool {
    for pod in pods {
        let Some(slot) = headroom.iter_mut().find(|free| free.fits(&pod.requests)) else {
            return false;
        };
        slot.deduct(&pod.requests);
    }
    true
}
