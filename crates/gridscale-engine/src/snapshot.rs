//! Read-only view of the orchestrator's cluster state.
//!
//! The orchestrator is an external collaborator: the engine consumes pending
//! pods and node records through this trait and never talks to a scheduler
//! directly. Cordoning is the one write-side nudge the loop needs before
//! handing a node to the backend for deletion.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use gridscale_core::{NodeRecord, PodSpec};

/// Result type alias for snapshot operations.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Errors surfaced by a cluster-snapshot implementation.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("orchestrator unreachable: {0}")]
    Unreachable(String),
}

/// Consumer interface over the cluster state.
#[async_trait]
pub trait ClusterSnapshot: Send + Sync {
    /// Pods the scheduler could not place.
    async fn pending_pods(&self) -> Vec<PodSpec>;

    /// All registered nodes.
    async fn nodes(&self) -> Vec<NodeRecord>;

    /// Pods currently bound to the named node.
    async fn pods_on_node(&self, node: &str) -> Vec<PodSpec>;

    /// The node group a node belongs to, when known.
    async fn node_group_for_node(&self, node: &NodeRecord) -> Option<String>;

    /// Mark a node unschedulable ahead of its termination.
    async fn cordon_node(&self, node: &str) -> SnapshotResult<()>;
}

/// Fixed snapshot backed by in-memory tables. Used by tests and by the
/// daemon's simulation mode, where no orchestrator is connected.
#[derive(Default)]
pub struct StaticSnapshot {
    pending: Vec<PodSpec>,
    nodes: Vec<NodeRecord>,
    pods_by_node: HashMap<String, Vec<PodSpec>>,
    groups_by_node: HashMap<String, String>,
    cordoned: Mutex<Vec<String>>,
}

impl StaticSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pending_pod(mut self, pod: PodSpec) -> Self {
        self.pending.push(pod);
        self
    }

    /// Register a node and the group it belongs to.
    pub fn with_node(mut self, node: NodeRecord, group: &str) -> Self {
        self.groups_by_node
            .insert(node.name.clone(), group.to_string());
        self.nodes.push(node);
        self
    }

    pub fn with_pods_on_node(mut self, node: &str, pods: Vec<PodSpec>) -> Self {
        self.pods_by_node.insert(node.to_string(), pods);
        self
    }

    /// Names of nodes cordoned through this snapshot.
    pub fn cordoned(&self) -> Vec<String> {
        self.cordoned.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterSnapshot for StaticSnapshot {
    async fn pending_pods(&self) -> Vec<PodSpec> {
        self.pending.clone()
    }

    async fn nodes(&self) -> Vec<NodeRecord> {
        self.nodes.clone()
    }

    async fn pods_on_node(&self, node: &str) -> Vec<PodSpec> {
        self.pods_by_node.get(node).cloned().unwrap_or_default()
    }

    async fn node_group_for_node(&self, node: &NodeRecord) -> Option<String> {
        self.groups_by_node.get(&node.name).cloned()
    }

    async fn cordon_node(&self, node: &str) -> SnapshotResult<()> {
        self.cordoned.lock().unwrap().push(node.to_string());
        Ok(())
    }
}
