//! Domain types for the GridScale autoscaler.
//!
//! These types flow between the cloud-provider interface, the scale-set
//! driver and the decision loop. They are plain values: instances and
//! descriptors are copied freely, ownership of the caches that hold them
//! lives in the driver.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name of a node group, unique per backend.
pub type GroupName = String;

/// Opaque, globally unique identifier a backend assigns to an instance.
pub type ProviderId = String;

// ── Node groups ────────────────────────────────────────────────────

/// Immutable per-group configuration, created at configuration load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeGroupSpec {
    pub name: GroupName,
    /// Smallest size the engine will ever shrink the group to.
    pub min_size: u32,
    /// Largest size the engine will ever grow the group to.
    pub max_size: u32,
    /// Per-group override for the size cache TTL, in seconds.
    pub size_ttl_seconds: Option<u64>,
    /// Ranking used by the priority expander (higher wins).
    pub priority: i32,
}

/// What the backend reported about a group on the last list call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupDescriptor {
    pub name: GroupName,
    /// The backend's current target capacity for the group.
    pub capacity: u32,
    /// Instance-type metadata; absent when the backend does not expose it,
    /// in which case no node template can be derived for the group.
    pub instance_type: Option<InstanceTypeSpec>,
    /// Labels newly created nodes of this group will carry.
    pub labels: HashMap<String, String>,
    /// Taints newly created nodes of this group will carry.
    pub taints: Vec<Taint>,
}

/// Machine shape backing a node group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceTypeSpec {
    pub name: String,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpu_count: u64,
    pub ephemeral_storage_bytes: u64,
    /// Maximum pods per node; 0 means the backend default applies.
    pub max_pods: u32,
}

// ── Instances ──────────────────────────────────────────────────────

/// Provisioning state of a single backend instance. Transitions are driven
/// by backend observations, never by local logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Creating,
    Running,
    Deleting,
    Unknown,
}

/// A backend instance as held in the driver's instance cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub provider_id: ProviderId,
    pub state: InstanceState,
}

// ── Resources ──────────────────────────────────────────────────────

/// Node-level resource quantities (capacity or allocatable).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpu_count: u64,
    pub ephemeral_storage_bytes: u64,
    pub pods: u32,
}

/// Resource requests of a single pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequests {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpu_count: u64,
}

impl Resources {
    /// Whether these quantities can accommodate the given requests.
    pub fn covers(&self, req: &ResourceRequests) -> bool {
        self.cpu_millis >= req.cpu_millis
            && self.memory_bytes >= req.memory_bytes
            && self.gpu_count >= req.gpu_count
    }
}

// ── Nodes, pods, templates ─────────────────────────────────────────

/// A taint on a node; pods must tolerate the key to schedule there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: String,
}

/// Synthetic node description derived from a group descriptor, used to
/// simulate scheduling without creating a real node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateNode {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub taints: Vec<Taint>,
    pub capacity: Resources,
    pub allocatable: Resources,
}

/// A pending or running pod as seen through the cluster snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub name: String,
    pub requests: ResourceRequests,
    /// Labels a hosting node must carry.
    pub node_selector: HashMap<String, String>,
    /// Taint keys this pod tolerates.
    pub tolerations: Vec<String>,
}

/// A registered node as seen through the cluster snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub provider_id: ProviderId,
    pub allocatable: Resources,
    pub ready: bool,
    pub unschedulable: bool,
}

// ── Expanders ──────────────────────────────────────────────────────

/// Policy that chooses among candidate groups when several could satisfy
/// a pending pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpanderStrategy {
    #[default]
    Random,
    MostPods,
    LeastWaste,
    Priority,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_cover_smaller_requests() {
        let node = Resources {
            cpu_millis: 2000,
            memory_bytes: 4 << 30,
            gpu_count: 0,
            ephemeral_storage_bytes: 20 << 30,
            pods: 110,
        };
        let req = ResourceRequests {
            cpu_millis: 500,
            memory_bytes: 1 << 30,
            gpu_count: 0,
        };
        assert!(node.covers(&req));
    }

    #[test]
    fn resources_reject_gpu_requests_without_gpus() {
        let node = Resources {
            cpu_millis: 2000,
            memory_bytes: 4 << 30,
            ..Resources::default()
        };
        let req = ResourceRequests {
            cpu_millis: 100,
            memory_bytes: 1 << 20,
            gpu_count: 1,
        };
        assert!(!node.covers(&req));
    }

    #[test]
    fn expander_strategy_deserializes_kebab_case() {
        let s: ExpanderStrategy = toml::from_str::<HashMap<String, ExpanderStrategy>>(
            "e = \"least-waste\"",
        )
        .unwrap()["e"];
        assert_eq!(s, ExpanderStrategy::LeastWaste);
    }
}
