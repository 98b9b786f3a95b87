//! In-memory backend with failure injection.
//!
//! `SimCloud` implements the full provider contract against process-local
//! state: groups, instances, asynchronous mutations. Throttles, rejections
//! and mutation failures can be injected, and every call is counted, which
//! makes it the backend of choice for driver and engine tests. The daemon
//! uses it as the built-in simulation mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use gridscale_core::{GroupDescriptor, InstanceTypeSpec, NodeGroupSpec};

use crate::error::{CloudError, CloudResult};
use crate::provider::{
    normalize_provider_id, CloudProvider, MutationHandle, MutationKind, RawInstance,
};

/// The backend tag `SimCloud` stamps on provider ids.
pub const SIM_TAG: &str = "sim";

struct SimInstance {
    /// Raw resource path, deliberately mixed-case so normalization is
    /// exercised end to end.
    id: String,
    state: String,
}

struct SimGroup {
    descriptor: GroupDescriptor,
    instances: Vec<SimInstance>,
    next_index: u64,
}

enum PendingKind {
    Resize {
        prior_capacity: u32,
        created: Vec<String>,
    },
    Delete {
        ids: Vec<String>,
    },
}

struct Pending {
    group: String,
    kind: PendingKind,
}

#[derive(Default)]
struct Injection {
    throttle_list_groups: u32,
    throttle_list_instances: u32,
    reject_mutations: bool,
    fail_awaits: u32,
}

#[derive(Default)]
struct SimState {
    groups: HashMap<String, SimGroup>,
    pending: HashMap<u64, Pending>,
    inject: Injection,
}

/// Per-operation call counters.
#[derive(Default)]
pub struct CallCounts {
    list_groups: AtomicU64,
    list_instances: AtomicU64,
    set_capacity: AtomicU64,
    delete_instances: AtomicU64,
    await_mutation: AtomicU64,
}

impl CallCounts {
    pub fn list_groups(&self) -> u64 {
        self.list_groups.load(Ordering::Relaxed)
    }
    pub fn list_instances(&self) -> u64 {
        self.list_instances.load(Ordering::Relaxed)
    }
    pub fn set_capacity(&self) -> u64 {
        self.set_capacity.load(Ordering::Relaxed)
    }
    pub fn delete_instances(&self) -> u64 {
        self.delete_instances.load(Ordering::Relaxed)
    }
    pub fn await_mutation(&self) -> u64 {
        self.await_mutation.load(Ordering::Relaxed)
    }
}

/// In-memory cloud backend.
pub struct SimCloud {
    state: Mutex<SimState>,
    calls: CallCounts,
    next_handle: AtomicU64,
}

impl SimCloud {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            calls: CallCounts::default(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Seed a group; `descriptor.capacity` running instances are created.
    pub fn with_group(self, descriptor: GroupDescriptor) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let key = descriptor.name.to_ascii_lowercase();
            let mut group = SimGroup {
                descriptor,
                instances: Vec::new(),
                next_index: 0,
            };
            for _ in 0..group.descriptor.capacity {
                let id = raw_instance_id(&group.descriptor.name, group.next_index);
                group.next_index += 1;
                group.instances.push(SimInstance {
                    id,
                    state: "Running".to_string(),
                });
            }
            state.groups.insert(key, group);
        }
        self
    }

    /// Build a backend mirroring the configured groups, each starting at its
    /// minimum size with a default instance type.
    pub fn from_specs(specs: &[NodeGroupSpec]) -> Self {
        let mut sim = Self::new();
        for spec in specs {
            sim = sim.with_group(GroupDescriptor {
                name: spec.name.clone(),
                capacity: spec.min_size,
                instance_type: Some(default_instance_type()),
                labels: HashMap::new(),
                taints: Vec::new(),
            });
        }
        sim
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    // ── Failure injection ──────────────────────────────────────────

    /// Throttle the next `n` `list_groups` calls.
    pub fn throttle_next_list_groups(&self, n: u32) {
        self.state.lock().unwrap().inject.throttle_list_groups = n;
    }

    /// Throttle the next `n` `list_instances` calls.
    pub fn throttle_next_list_instances(&self, n: u32) {
        self.state.lock().unwrap().inject.throttle_list_instances = n;
    }

    /// Reject all mutations until turned off again.
    pub fn reject_mutations(&self, reject: bool) {
        self.state.lock().unwrap().inject.reject_mutations = reject;
    }

    /// Fail the next awaited mutation and roll its effects back.
    pub fn fail_next_await(&self) {
        self.state.lock().unwrap().inject.fail_awaits += 1;
    }

    // ── Test inspection helpers ────────────────────────────────────

    /// Force an instance's provisioning state.
    pub fn set_instance_state(&self, group: &str, index: usize, provisioning_state: &str) {
        let mut state = self.state.lock().unwrap();
        let group = state
            .groups
            .get_mut(&group.to_ascii_lowercase())
            .expect("unknown sim group");
        group.instances[index].state = provisioning_state.to_string();
    }

    /// Current backend-side capacity of a group.
    pub fn group_capacity(&self, group: &str) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state
            .groups
            .get(&group.to_ascii_lowercase())
            .map(|g| g.descriptor.capacity)
    }

    /// Raw (un-normalized) instance ids of a group.
    pub fn raw_instance_ids(&self, group: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .groups
            .get(&group.to_ascii_lowercase())
            .map(|g| g.instances.iter().map(|i| i.id.clone()).collect())
            .unwrap_or_default()
    }

    fn next_handle(&self, group: &str, kind: MutationKind) -> MutationHandle {
        MutationHandle {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            group: group.to_string(),
            kind,
        }
    }
}

impl Default for SimCloud {
    fn default() -> Self {
        Self::new()
    }
}

/// Instance type used when no explicit descriptor is seeded.
pub fn default_instance_type() -> InstanceTypeSpec {
    InstanceTypeSpec {
        name: "sim-standard-4".to_string(),
        cpu_millis: 4000,
        memory_bytes: 16 << 30,
        gpu_count: 0,
        ephemeral_storage_bytes: 100 << 30,
        max_pods: 110,
    }
}

fn raw_instance_id(group: &str, index: u64) -> String {
    format!("/Pools/{group}/Instances/{index}")
}

#[async_trait]
impl CloudProvider for SimCloud {
    fn name(&self) -> &str {
        SIM_TAG
    }

    async fn list_groups(&self) -> CloudResult<Vec<GroupDescriptor>> {
        self.calls.list_groups.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        if state.inject.throttle_list_groups > 0 {
            state.inject.throttle_list_groups -= 1;
            return Err(CloudError::Throttled("simulated rate limit".to_string()));
        }
        Ok(state.groups.values().map(|g| g.descriptor.clone()).collect())
    }

    async fn group_of_instance(&self, provider_id: &str) -> CloudResult<Option<String>> {
        let path = provider_id
            .to_ascii_lowercase()
            .strip_prefix(&format!("{SIM_TAG}://"))
            .map(str::to_string)
            .unwrap_or_else(|| provider_id.to_ascii_lowercase());
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            ["pools", group, "instances", _index] => {
                let state = self.state.lock().unwrap();
                Ok(state.groups.get(*group).map(|g| g.descriptor.name.clone()))
            }
            _ => Err(CloudError::MalformedId(provider_id.to_string())),
        }
    }

    async fn list_instances(&self, group: &str) -> CloudResult<Vec<RawInstance>> {
        self.calls.list_instances.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        if state.inject.throttle_list_instances > 0 {
            state.inject.throttle_list_instances -= 1;
            return Err(CloudError::Throttled("simulated rate limit".to_string()));
        }
        let group = state
            .groups
            .get(&group.to_ascii_lowercase())
            .ok_or_else(|| CloudError::UnknownGroup(group.to_string()))?;
        Ok(group
            .instances
            .iter()
            .map(|i| RawInstance {
                provider_id: i.id.clone(),
                provisioning_state: i.state.clone(),
            })
            .collect())
    }

    async fn set_capacity(&self, group: &str, capacity: u32) -> CloudResult<MutationHandle> {
        self.calls.set_capacity.fetch_add(1, Ordering::Relaxed);
        let handle = self.next_handle(group, MutationKind::Resize);
        let mut state = self.state.lock().unwrap();
        if state.inject.reject_mutations {
            return Err(CloudError::Rejected("simulated rejection".to_string()));
        }
        let key = group.to_ascii_lowercase();
        let sim_group = state
            .groups
            .get_mut(&key)
            .ok_or_else(|| CloudError::UnknownGroup(group.to_string()))?;

        let prior_capacity = sim_group.descriptor.capacity;
        sim_group.descriptor.capacity = capacity;

        let mut created = Vec::new();
        while (sim_group.instances.len() as u32) < capacity {
            let id = raw_instance_id(&sim_group.descriptor.name, sim_group.next_index);
            sim_group.next_index += 1;
            created.push(id.clone());
            sim_group.instances.push(SimInstance {
                id,
                state: "Creating".to_string(),
            });
        }
        while (sim_group.instances.len() as u32) > capacity {
            sim_group.instances.pop();
        }

        state.pending.insert(
            handle.id,
            Pending {
                group: key,
                kind: PendingKind::Resize {
                    prior_capacity,
                    created,
                },
            },
        );
        Ok(handle)
    }

    async fn delete_instances(&self, group: &str, ids: &[String]) -> CloudResult<MutationHandle> {
        self.calls.delete_instances.fetch_add(1, Ordering::Relaxed);
        let handle = self.next_handle(group, MutationKind::Delete);
        let mut state = self.state.lock().unwrap();
        if state.inject.reject_mutations {
            return Err(CloudError::Rejected("simulated rejection".to_string()));
        }
        let key = group.to_ascii_lowercase();
        let sim_group = state
            .groups
            .get_mut(&key)
            .ok_or_else(|| CloudError::UnknownGroup(group.to_string()))?;

        let mut normalized = Vec::with_capacity(ids.len());
        for id in ids {
            let wanted = id.to_ascii_lowercase();
            let found = sim_group
                .instances
                .iter_mut()
                .find(|i| normalize_provider_id(SIM_TAG, &i.id) == wanted);
            match found {
                Some(instance) => {
                    instance.state = "Deleting".to_string();
                    normalized.push(wanted);
                }
                None => {
                    return Err(CloudError::Rejected(format!(
                        "instance {id} is not part of group {group}"
                    )));
                }
            }
        }

        state.pending.insert(
            handle.id,
            Pending {
                group: key,
                kind: PendingKind::Delete { ids: normalized },
            },
        );
        Ok(handle)
    }

    async fn await_mutation(&self, handle: MutationHandle) -> CloudResult<()> {
        self.calls.await_mutation.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        let pending = state
            .pending
            .remove(&handle.id)
            .ok_or_else(|| CloudError::Rejected(format!("unknown mutation {}", handle.id)))?;

        let fail = state.inject.fail_awaits > 0;
        if fail {
            state.inject.fail_awaits -= 1;
        }

        let Some(sim_group) = state.groups.get_mut(&pending.group) else {
            return Err(CloudError::UnknownGroup(pending.group));
        };

        match pending.kind {
            PendingKind::Resize {
                prior_capacity,
                created,
            } => {
                if fail {
                    sim_group.descriptor.capacity = prior_capacity;
                    sim_group.instances.retain(|i| !created.contains(&i.id));
                    return Err(CloudError::Transient(
                        "simulated capacity update failure".to_string(),
                    ));
                }
                for instance in &mut sim_group.instances {
                    if instance.state == "Creating" {
                        instance.state = "Running".to_string();
                    }
                }
            }
            PendingKind::Delete { ids } => {
                if fail {
                    for instance in &mut sim_group.instances {
                        if ids.contains(&normalize_provider_id(SIM_TAG, &instance.id)) {
                            instance.state = "Running".to_string();
                        }
                    }
                    return Err(CloudError::Transient(
                        "simulated instance deletion failure".to_string(),
                    ));
                }
                let before = sim_group.instances.len();
                sim_group
                    .instances
                    .retain(|i| !ids.contains(&normalize_provider_id(SIM_TAG, &i.id)));
                let removed = (before - sim_group.instances.len()) as u32;
                sim_group.descriptor.capacity =
                    sim_group.descriptor.capacity.saturating_sub(removed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(name: &str, capacity: u32) -> SimCloud {
        SimCloud::new().with_group(GroupDescriptor {
            name: name.to_string(),
            capacity,
            instance_type: Some(default_instance_type()),
            labels: HashMap::new(),
            taints: Vec::new(),
        })
    }

    #[tokio::test]
    async fn seeded_group_lists_running_instances() {
        let sim = seeded("pool-a", 3);
        let groups = sim.list_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].capacity, 3);

        let instances = sim.list_instances("pool-a").await.unwrap();
        assert_eq!(instances.len(), 3);
        assert!(instances.iter().all(|i| i.provisioning_state == "Running"));
    }

    #[tokio::test]
    async fn resolves_owning_group_case_insensitively() {
        let sim = seeded("pool-a", 1);
        let raw = sim.raw_instance_ids("pool-a")[0].clone();
        let owner = sim.group_of_instance(&raw).await.unwrap();
        assert_eq!(owner.as_deref(), Some("pool-a"));

        let normalized = normalize_provider_id(SIM_TAG, &raw);
        let owner = sim.group_of_instance(&normalized).await.unwrap();
        assert_eq!(owner.as_deref(), Some("pool-a"));
    }

    #[tokio::test]
    async fn malformed_id_is_fatal() {
        let sim = seeded("pool-a", 1);
        let err = sim.group_of_instance("sim://garbage").await.unwrap_err();
        assert!(matches!(err, CloudError::MalformedId(_)));
    }

    #[tokio::test]
    async fn resize_creates_then_runs_instances() {
        let sim = seeded("pool-a", 1);
        let handle = sim.set_capacity("pool-a", 3).await.unwrap();
        assert_eq!(sim.group_capacity("pool-a"), Some(3));

        let instances = sim.list_instances("pool-a").await.unwrap();
        assert_eq!(
            instances
                .iter()
                .filter(|i| i.provisioning_state == "Creating")
                .count(),
            2
        );

        sim.await_mutation(handle).await.unwrap();
        let instances = sim.list_instances("pool-a").await.unwrap();
        assert!(instances.iter().all(|i| i.provisioning_state == "Running"));
    }

    #[tokio::test]
    async fn failed_resize_rolls_back() {
        let sim = seeded("pool-a", 1);
        sim.fail_next_await();
        let handle = sim.set_capacity("pool-a", 3).await.unwrap();
        let err = sim.await_mutation(handle).await.unwrap_err();
        assert!(matches!(err, CloudError::Transient(_)));
        assert_eq!(sim.group_capacity("pool-a"), Some(1));
        assert_eq!(sim.list_instances("pool-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_marks_then_removes() {
        let sim = seeded("pool-a", 2);
        let target = normalize_provider_id(SIM_TAG, &sim.raw_instance_ids("pool-a")[0]);
        let handle = sim
            .delete_instances("pool-a", &[target.clone()])
            .await
            .unwrap();

        let instances = sim.list_instances("pool-a").await.unwrap();
        assert!(instances.iter().any(|i| i.provisioning_state == "Deleting"));

        sim.await_mutation(handle).await.unwrap();
        assert_eq!(sim.group_capacity("pool-a"), Some(1));
        assert_eq!(sim.list_instances("pool-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_foreign_instance_is_rejected() {
        let sim = seeded("pool-a", 1);
        let err = sim
            .delete_instances("pool-a", &["sim://pools/pool-b/instances/0".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Rejected(_)));
    }

    #[tokio::test]
    async fn throttle_injection_applies_once_per_call() {
        let sim = seeded("pool-a", 1);
        sim.throttle_next_list_groups(1);
        assert!(matches!(
            sim.list_groups().await,
            Err(CloudError::Throttled(_))
        ));
        assert!(sim.list_groups().await.is_ok());
        assert_eq!(sim.calls().list_groups(), 2);
    }
}
