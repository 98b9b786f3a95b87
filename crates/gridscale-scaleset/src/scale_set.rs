//! Per-group scale-set driver.
//!
//! Each `ScaleSet` reconciles one node group's size against the backend
//! through two time-bounded caches. The size cache and the instance cache
//! have separate locks and no code path holds both at once; mutations spawn
//! detached observers whose only side effects are cache invalidation and
//! logging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use gridscale_cloud::{
    build_template_node, normalize_provider_id, with_deadline, CloudProvider, MutationHandle,
    RawInstance, RetryClass,
};
use gridscale_core::{Instance, InstanceState, NodeGroupSpec, NodeRecord, TemplateNode};

use crate::error::{ScaleSetError, ScaleSetResult};
use crate::group_cache::GroupCache;

/// Default TTL of the cached group size.
pub const DEFAULT_SIZE_REFRESH_PERIOD: Duration = Duration::from_secs(15);

/// Default TTL of the cached instance list.
pub const DEFAULT_INSTANCE_REFRESH_PERIOD: Duration = Duration::from_secs(300);

/// Deadline applied to every backend call, including mutation awaits.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(180);

#[derive(Debug, Default)]
struct SizeCache {
    /// `None` until the backend has been observed at least once.
    current: Option<u32>,
    last_refresh: Option<Instant>,
}

impl SizeCache {
    fn is_fresh(&self, period: Duration) -> bool {
        matches!(self.last_refresh, Some(at) if at.elapsed() < period)
    }
}

#[derive(Debug, Default)]
struct InstanceCache {
    entries: Vec<Instance>,
    last_refresh: Option<Instant>,
}

impl InstanceCache {
    /// Valid only while its length matches the current size and the refresh
    /// period has not elapsed.
    fn is_valid(&self, current: u32, period: Duration) -> bool {
        self.entries.len() == current as usize
            && matches!(self.last_refresh, Some(at) if at.elapsed() < period)
    }

    fn invalidate(&mut self) {
        self.last_refresh = None;
    }
}

/// Driver for one node group.
pub struct ScaleSet {
    spec: NodeGroupSpec,
    provider: Arc<dyn CloudProvider>,
    groups: Arc<GroupCache>,
    size: Arc<Mutex<SizeCache>>,
    instances: Arc<Mutex<InstanceCache>>,
    size_refresh_period: Duration,
    instance_refresh_period: Duration,
    call_deadline: Duration,
    /// How often a throttled refresh was answered from stale cache.
    stale_serves: AtomicU64,
}

impl ScaleSet {
    pub fn new(
        spec: NodeGroupSpec,
        provider: Arc<dyn CloudProvider>,
        groups: Arc<GroupCache>,
    ) -> Self {
        let size_refresh_period = spec
            .size_ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SIZE_REFRESH_PERIOD);
        Self {
            spec,
            provider,
            groups,
            size: Arc::new(Mutex::new(SizeCache::default())),
            instances: Arc::new(Mutex::new(InstanceCache::default())),
            size_refresh_period,
            instance_refresh_period: DEFAULT_INSTANCE_REFRESH_PERIOD,
            call_deadline: DEFAULT_CALL_DEADLINE,
            stale_serves: AtomicU64::new(0),
        }
    }

    /// Times a throttled backend answer was replaced by stale cache data.
    pub fn stale_cache_serves(&self) -> u64 {
        self.stale_serves.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn min_size(&self) -> u32 {
        self.spec.min_size
    }

    pub fn max_size(&self) -> u32 {
        self.spec.max_size
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority
    }

    pub fn spec(&self) -> &NodeGroupSpec {
        &self.spec
    }

    /// Current target size of the group.
    ///
    /// Serves the cached value while fresh; otherwise refreshes through the
    /// group cache. A throttled refresh returns the stale value and defers
    /// the next refresh by a full period so the backend is not hammered.
    pub async fn target_size(&self) -> ScaleSetResult<u32> {
        {
            let size = self.size.lock().await;
            if size.is_fresh(self.size_refresh_period) {
                return size
                    .current
                    .ok_or_else(|| ScaleSetError::NotInitialized(self.spec.name.clone()));
            }
        }

        // Fetch with no cache lock held.
        match self.groups.describe(self.provider.as_ref(), &self.spec.name).await {
            Ok(descriptor) => {
                let capacity_changed = {
                    let mut size = self.size.lock().await;
                    let changed = size.current != Some(descriptor.capacity);
                    size.current = Some(descriptor.capacity);
                    size.last_refresh = Some(Instant::now());
                    changed
                };
                if capacity_changed {
                    self.instances.lock().await.invalidate();
                }
                debug!(group = %self.spec.name, capacity = descriptor.capacity, "observed group size");
                Ok(descriptor.capacity)
            }
            Err(e) if e.is_throttled() => {
                let mut size = self.size.lock().await;
                warn!(
                    group = %self.spec.name,
                    error = %e,
                    "size refresh throttled, serving cached value and deferring next refresh"
                );
                size.last_refresh = Some(Instant::now());
                self.stale_serves.fetch_add(1, Ordering::Relaxed);
                size.current.ok_or(ScaleSetError::Cloud(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ask the backend for a new target capacity.
    ///
    /// The local size cache is updated proactively so the decision loop sees
    /// the intended state immediately; a detached observer re-syncs the
    /// caches if the remote mutation ultimately fails.
    pub async fn set_size(&self, target: u32) -> ScaleSetResult<()> {
        if target > self.spec.max_size {
            return Err(ScaleSetError::ExceedsMax {
                group: self.spec.name.clone(),
                requested: target,
                max: self.spec.max_size,
            });
        }

        let handle = with_deadline(
            self.call_deadline,
            self.provider.set_capacity(&self.spec.name, target),
        )
        .await?;

        {
            let mut size = self.size.lock().await;
            size.current = Some(target);
            size.last_refresh = Some(Instant::now());
        }
        self.instances.lock().await.invalidate();

        info!(group = %self.spec.name, target, "capacity update issued");
        self.spawn_resize_observer(handle, target);
        Ok(())
    }

    /// Grow the group by `delta` nodes.
    pub async fn increase_size(&self, delta: u32) -> ScaleSetResult<()> {
        if delta == 0 {
            return Err(ScaleSetError::NonPositiveDelta);
        }

        let current = self.target_size().await?;
        let target = current
            .checked_add(delta)
            .filter(|t| *t <= self.spec.max_size)
            .ok_or_else(|| ScaleSetError::ExceedsMax {
                group: self.spec.name.clone(),
                requested: current.saturating_add(delta),
                max: self.spec.max_size,
            })?;

        self.set_size(target).await
    }

    /// Shrinking the target is a backend-side effect of instance deletion,
    /// so this only nudges the caches back into line.
    pub async fn decrease_target_size(&self, _delta: u32) -> ScaleSetResult<()> {
        self.instances.lock().await.invalidate();
        self.target_size().await.map(|_| ())
    }

    /// Whether the node's provider id resolves to this group.
    pub async fn belongs(&self, node: &NodeRecord) -> ScaleSetResult<bool> {
        let owner = self.owning_group(&node.provider_id).await?;
        Ok(owner.eq_ignore_ascii_case(&self.spec.name))
    }

    /// Instances of this group, from cache when valid.
    ///
    /// A throttled list returns the stale cache and defers the next refresh.
    pub async fn nodes(&self) -> ScaleSetResult<Vec<Instance>> {
        let current = self.target_size().await?;

        let mut cache = self.instances.lock().await;
        if cache.is_valid(current, self.instance_refresh_period) {
            return Ok(cache.entries.clone());
        }

        match with_deadline(
            self.call_deadline,
            self.provider.list_instances(&self.spec.name),
        )
        .await
        {
            Ok(raw) => {
                cache.entries = build_instance_cache(self.provider.name(), raw);
                cache.last_refresh = Some(Instant::now());
                debug!(
                    group = %self.spec.name,
                    instances = cache.entries.len(),
                    "rebuilt instance cache"
                );
                Ok(cache.entries.clone())
            }
            Err(e) if e.is_throttled() => {
                warn!(
                    group = %self.spec.name,
                    error = %e,
                    "instance listing throttled, serving cached instances"
                );
                cache.last_refresh = Some(Instant::now());
                self.stale_serves.fetch_add(1, Ordering::Relaxed);
                Ok(cache.entries.clone())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete specific instances. All of them must resolve to the same
    /// group; instances already observed as deleting are skipped.
    pub async fn delete_instances(&self, provider_ids: &[String]) -> ScaleSetResult<()> {
        if provider_ids.is_empty() {
            return Ok(());
        }

        let common = self.owning_group(&provider_ids[0]).await?;

        let mut eligible = Vec::with_capacity(provider_ids.len());
        for id in provider_ids {
            let owner = self.owning_group(id).await?;
            if !owner.eq_ignore_ascii_case(&common) {
                return Err(ScaleSetError::ForeignInstance {
                    instance: id.clone(),
                    group: common,
                });
            }
            if let Some(cached) = self.cached_instance(id).await {
                if cached.state == InstanceState::Deleting {
                    debug!(group = %self.spec.name, instance = %id, "already deleting, skipping");
                    continue;
                }
            }
            eligible.push(id.clone());
        }

        if eligible.is_empty() {
            debug!(group = %self.spec.name, "no instances eligible for deletion");
            return Ok(());
        }

        // Issuance is serialized under the instance lock so two callers
        // cannot submit overlapping deletes.
        let handle = {
            let _cache = self.instances.lock().await;
            with_deadline(
                self.call_deadline,
                self.provider.delete_instances(&common, &eligible),
            )
            .await?
        };

        {
            // Keep reads from dipping below the minimum on stale cache.
            let mut size = self.size.lock().await;
            if let Some(current) = size.current {
                size.current = Some(current.saturating_sub(eligible.len() as u32));
            }
        }

        info!(group = %self.spec.name, count = eligible.len(), "instance deletion issued");
        self.spawn_delete_observer(handle, eligible);
        Ok(())
    }

    /// Delete the given nodes after checking group membership and the
    /// minimum-size bound.
    pub async fn delete_nodes(&self, nodes: &[NodeRecord]) -> ScaleSetResult<()> {
        let current = self.target_size().await?;
        if current <= self.spec.min_size {
            return Err(ScaleSetError::MinSizeReached(self.spec.name.clone()));
        }

        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            if !self.belongs(node).await? {
                return Err(ScaleSetError::ForeignInstance {
                    instance: node.name.clone(),
                    group: self.spec.name.clone(),
                });
            }
            ids.push(node.provider_id.clone());
        }

        self.delete_instances(&ids).await
    }

    /// Synthetic node for scheduling simulation.
    pub async fn template_node_info(&self) -> ScaleSetResult<TemplateNode> {
        let descriptor = self
            .groups
            .describe(self.provider.as_ref(), &self.spec.name)
            .await?;
        Ok(build_template_node(&descriptor)?)
    }

    // ── Internal helpers ───────────────────────────────────────────

    async fn owning_group(&self, provider_id: &str) -> ScaleSetResult<String> {
        let owner = with_deadline(
            self.call_deadline,
            self.provider.group_of_instance(provider_id),
        )
        .await?;
        owner.ok_or_else(|| ScaleSetError::UnknownInstance(provider_id.to_string()))
    }

    async fn cached_instance(&self, provider_id: &str) -> Option<Instance> {
        let wanted = provider_id.to_ascii_lowercase();
        let cache = self.instances.lock().await;
        cache
            .entries
            .iter()
            .find(|i| i.provider_id == wanted)
            .cloned()
    }

    fn spawn_resize_observer(&self, handle: MutationHandle, target: u32) {
        let provider = Arc::clone(&self.provider);
        let groups = Arc::clone(&self.groups);
        let size = Arc::clone(&self.size);
        let instances = Arc::clone(&self.instances);
        let deadline = self.call_deadline;
        let group = self.spec.name.clone();

        tokio::spawn(async move {
            match with_deadline(deadline, provider.await_mutation(handle)).await {
                Ok(()) => {
                    debug!(%group, target, "capacity update completed");
                    instances.lock().await.invalidate();
                }
                Err(e) => {
                    error!(
                        %group,
                        target,
                        error = %e,
                        "capacity update failed, invalidating size caches"
                    );
                    size.lock().await.last_refresh = None;
                    groups.invalidate().await;
                }
            }
        });
    }

    fn spawn_delete_observer(&self, handle: MutationHandle, ids: Vec<String>) {
        let provider = Arc::clone(&self.provider);
        let size = Arc::clone(&self.size);
        let deadline = self.call_deadline;
        let group = self.spec.name.clone();

        tokio::spawn(async move {
            match with_deadline(deadline, provider.await_mutation(handle)).await {
                Ok(()) => {
                    info!(%group, count = ids.len(), "instance deletion completed");
                }
                Err(e) => {
                    error!(
                        %group,
                        count = ids.len(),
                        error = %e,
                        "instance deletion failed, invalidating size cache"
                    );
                    size.lock().await.last_refresh = None;
                }
            }
        });
    }
}

/// Rebuild the instance cache from a raw backend listing.
///
/// Entries with an empty identifier are mid-deletion on the backend and are
/// dropped; everything else is normalized to the canonical id form.
fn build_instance_cache(tag: &str, raw: Vec<RawInstance>) -> Vec<Instance> {
    raw.into_iter()
        .filter(|r| !r.provider_id.is_empty())
        .map(|r| Instance {
            provider_id: normalize_provider_id(tag, &r.provider_id),
            state: map_provisioning_state(&r.provisioning_state),
        })
        .collect()
}

fn map_provisioning_state(state: &str) -> InstanceState {
    if state.eq_ignore_ascii_case("deleting") {
        InstanceState::Deleting
    } else if state.eq_ignore_ascii_case("creating") {
        InstanceState::Creating
    } else {
        InstanceState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscale_cloud::sim::default_instance_type;
    use gridscale_cloud::{CloudError, SimCloud};
    use gridscale_core::GroupDescriptor;
    use std::collections::HashMap;

    fn spec(name: &str, min: u32, max: u32) -> NodeGroupSpec {
        NodeGroupSpec {
            name: name.to_string(),
            min_size: min,
            max_size: max,
            size_ttl_seconds: None,
            priority: 0,
        }
    }

    fn descriptor(name: &str, capacity: u32) -> GroupDescriptor {
        GroupDescriptor {
            name: name.to_string(),
            capacity,
            instance_type: Some(default_instance_type()),
            labels: HashMap::new(),
            taints: Vec::new(),
        }
    }

    fn harness(spec_: NodeGroupSpec, capacity: u32) -> (Arc<SimCloud>, ScaleSet) {
        let sim = Arc::new(SimCloud::new().with_group(descriptor(&spec_.name, capacity)));
        let groups = Arc::new(GroupCache::new(
            DEFAULT_SIZE_REFRESH_PERIOD,
            DEFAULT_CALL_DEADLINE,
        ));
        let provider: Arc<dyn CloudProvider> = sim.clone();
        let set = ScaleSet::new(spec_, provider, groups);
        (sim, set)
    }

    fn node(name: &str, provider_id: &str) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            provider_id: provider_id.to_string(),
            allocatable: Default::default(),
            ready: true,
            unschedulable: false,
        }
    }

    fn normalized_ids(sim: &SimCloud, group: &str) -> Vec<String> {
        sim.raw_instance_ids(group)
            .iter()
            .map(|raw| normalize_provider_id("sim", raw))
            .collect()
    }

    /// Let detached observers run to completion on the test runtime.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn bounds_are_immutable() {
        let (_sim, set) = harness(spec("pool-a", 1, 5), 2);
        assert_eq!(set.min_size(), 1);
        assert_eq!(set.max_size(), 5);
        assert_eq!(set.name(), "pool-a");
    }

    #[tokio::test]
    async fn target_size_is_cached_within_period() {
        let (sim, set) = harness(spec("pool-a", 1, 5), 2);
        assert_eq!(set.target_size().await.unwrap(), 2);
        assert_eq!(set.target_size().await.unwrap(), 2);
        assert_eq!(sim.calls().list_groups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_refresh_serves_stale_and_defers() {
        let (sim, set) = harness(spec("pool-a", 1, 8), 4);
        assert_eq!(set.target_size().await.unwrap(), 4);

        tokio::time::advance(Duration::from_secs(16)).await;
        sim.throttle_next_list_groups(1);

        // Throttled refresh returns the cached value...
        assert_eq!(set.target_size().await.unwrap(), 4);
        assert_eq!(sim.calls().list_groups(), 2);

        // ...and defers the next refresh, so no further backend call is made
        // within the period.
        assert_eq!(set.target_size().await.unwrap(), 4);
        assert_eq!(sim.calls().list_groups(), 2);
        assert_eq!(set.stale_cache_serves(), 1);
    }

    #[tokio::test]
    async fn throttle_before_any_observation_reports_not_initialized() {
        let (sim, set) = harness(spec("pool-a", 1, 8), 4);
        sim.throttle_next_list_groups(1);

        // The throttled first refresh has no stale value to serve.
        assert!(matches!(
            set.target_size().await,
            Err(ScaleSetError::Cloud(CloudError::Throttled(_)))
        ));
        // The deferred window now reports the group as initializing.
        assert!(matches!(
            set.target_size().await,
            Err(ScaleSetError::NotInitialized(_))
        ));
        assert_eq!(sim.calls().list_groups(), 1);
    }

    #[tokio::test]
    async fn increase_size_updates_cache_proactively() {
        let (sim, set) = harness(spec("pool-a", 1, 5), 2);
        set.increase_size(1).await.unwrap();

        assert_eq!(sim.calls().set_capacity(), 1);
        assert_eq!(sim.group_capacity("pool-a"), Some(3));
        // The new target is visible without another list call.
        let lists_before = sim.calls().list_groups();
        assert_eq!(set.target_size().await.unwrap(), 3);
        assert_eq!(sim.calls().list_groups(), lists_before);
    }

    #[tokio::test]
    async fn increase_size_invalidates_instance_cache() {
        let (sim, set) = harness(spec("pool-a", 1, 5), 2);
        set.nodes().await.unwrap();
        assert_eq!(sim.calls().list_instances(), 1);

        set.increase_size(1).await.unwrap();
        let instances = set.nodes().await.unwrap();
        assert_eq!(sim.calls().list_instances(), 2);
        assert_eq!(instances.len(), 3);
    }

    #[tokio::test]
    async fn increase_of_zero_is_rejected() {
        let (sim, set) = harness(spec("pool-a", 1, 5), 2);
        assert!(matches!(
            set.increase_size(0).await,
            Err(ScaleSetError::NonPositiveDelta)
        ));
        assert_eq!(sim.calls().set_capacity(), 0);
    }

    #[tokio::test]
    async fn increase_past_max_is_rejected_without_backend_call() {
        let (sim, set) = harness(spec("pool-a", 0, 3), 3);
        assert!(matches!(
            set.increase_size(1).await,
            Err(ScaleSetError::ExceedsMax { requested: 4, max: 3, .. })
        ));
        assert_eq!(sim.calls().set_capacity(), 0);
    }

    #[tokio::test]
    async fn set_size_past_max_is_rejected() {
        let (sim, set) = harness(spec("pool-a", 0, 3), 1);
        assert!(matches!(
            set.set_size(9).await,
            Err(ScaleSetError::ExceedsMax { .. })
        ));
        assert_eq!(sim.calls().set_capacity(), 0);
    }

    #[tokio::test]
    async fn failed_mutation_invalidates_both_size_caches() {
        let (sim, set) = harness(spec("pool-a", 1, 8), 2);
        assert_eq!(set.target_size().await.unwrap(), 2);
        assert_eq!(sim.calls().list_groups(), 1);

        sim.fail_next_await();
        set.set_size(5).await.unwrap();
        settle().await;

        // The observer saw the failure; the next read must bypass both the
        // per-set cache and the shared group cache.
        assert_eq!(set.target_size().await.unwrap(), 2);
        assert_eq!(sim.calls().list_groups(), 2);
    }

    #[tokio::test]
    async fn successful_mutation_keeps_proactive_size() {
        let (sim, set) = harness(spec("pool-a", 1, 8), 2);
        set.set_size(5).await.unwrap();
        settle().await;

        let lists_before = sim.calls().list_groups();
        assert_eq!(set.target_size().await.unwrap(), 5);
        assert_eq!(sim.calls().list_groups(), lists_before);
    }

    #[tokio::test]
    async fn nodes_are_normalized_and_cached() {
        let (sim, set) = harness(spec("pool-a", 1, 5), 2);
        let instances = set.nodes().await.unwrap();
        assert_eq!(instances.len(), 2);
        for instance in &instances {
            assert!(instance.provider_id.starts_with("sim://pools/pool-a/"));
            assert_eq!(instance.provider_id, instance.provider_id.to_lowercase());
            assert_eq!(instance.state, InstanceState::Running);
        }

        set.nodes().await.unwrap();
        assert_eq!(sim.calls().list_instances(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_instance_listing_serves_stale_and_defers() {
        let (sim, set) = harness(spec("pool-a", 1, 5), 2);
        set.nodes().await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        sim.throttle_next_list_instances(1);

        let stale = set.nodes().await.unwrap();
        assert_eq!(stale.len(), 2);
        assert_eq!(sim.calls().list_instances(), 2);

        // Deferred: the very next read serves the cache.
        set.nodes().await.unwrap();
        assert_eq!(sim.calls().list_instances(), 2);
    }

    #[tokio::test]
    async fn delete_skips_instances_already_deleting() {
        let (sim, set) = harness(spec("pool-a", 0, 5), 3);
        sim.set_instance_state("pool-a", 1, "Deleting");
        set.nodes().await.unwrap();

        let ids = normalized_ids(&sim, "pool-a");
        set.delete_instances(&[ids[0].clone(), ids[1].clone()])
            .await
            .unwrap();

        assert_eq!(sim.calls().delete_instances(), 1);
        // Proactive decrement counts only the instance actually submitted.
        let lists_before = sim.calls().list_groups();
        assert_eq!(set.target_size().await.unwrap(), 2);
        assert_eq!(sim.calls().list_groups(), lists_before);
    }

    #[tokio::test]
    async fn delete_of_empty_list_is_a_silent_success() {
        let (sim, set) = harness(spec("pool-a", 0, 5), 2);
        set.delete_instances(&[]).await.unwrap();
        assert_eq!(sim.calls().delete_instances(), 0);
    }

    #[tokio::test]
    async fn delete_mixing_groups_is_rejected_before_any_mutation() {
        let sim = Arc::new(
            SimCloud::new()
                .with_group(descriptor("pool-a", 2))
                .with_group(descriptor("pool-b", 2)),
        );
        let groups = Arc::new(GroupCache::new(
            DEFAULT_SIZE_REFRESH_PERIOD,
            DEFAULT_CALL_DEADLINE,
        ));
        let provider: Arc<dyn CloudProvider> = sim.clone();
        let set = ScaleSet::new(spec("pool-a", 0, 5), provider, groups);
        assert_eq!(set.target_size().await.unwrap(), 2);

        let a = normalized_ids(&sim, "pool-a")[0].clone();
        let b = normalized_ids(&sim, "pool-b")[0].clone();
        assert!(matches!(
            set.delete_instances(&[a, b]).await,
            Err(ScaleSetError::ForeignInstance { .. })
        ));
        assert_eq!(sim.calls().delete_instances(), 0);
        // curSize is untouched.
        assert_eq!(set.target_size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_nodes_at_min_size_is_refused() {
        let (sim, set) = harness(spec("pool-a", 2, 5), 2);
        let ids = normalized_ids(&sim, "pool-a");
        let err = set
            .delete_nodes(&[node("n0", &ids[0])])
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleSetError::MinSizeReached(_)));
        assert_eq!(sim.calls().delete_instances(), 0);
    }

    #[tokio::test]
    async fn delete_nodes_from_other_group_is_refused() {
        let sim = Arc::new(
            SimCloud::new()
                .with_group(descriptor("pool-a", 2))
                .with_group(descriptor("pool-b", 2)),
        );
        let groups = Arc::new(GroupCache::new(
            DEFAULT_SIZE_REFRESH_PERIOD,
            DEFAULT_CALL_DEADLINE,
        ));
        let provider: Arc<dyn CloudProvider> = sim.clone();
        let set = ScaleSet::new(spec("pool-a", 0, 5), provider, groups);

        let foreign = normalized_ids(&sim, "pool-b")[0].clone();
        let err = set
            .delete_nodes(&[node("nb", &foreign)])
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleSetError::ForeignInstance { .. }));
    }

    #[tokio::test]
    async fn delete_nodes_decrements_current_size() {
        let (sim, set) = harness(spec("pool-a", 0, 5), 3);
        let ids = normalized_ids(&sim, "pool-a");
        set.delete_nodes(&[node("n0", &ids[0]), node("n1", &ids[1])])
            .await
            .unwrap();

        let lists_before = sim.calls().list_groups();
        assert_eq!(set.target_size().await.unwrap(), 1);
        assert_eq!(sim.calls().list_groups(), lists_before);
    }

    #[tokio::test]
    async fn belongs_compares_groups_case_insensitively() {
        let (sim, set) = harness(spec("Pool-A", 0, 5), 1);
        let id = normalized_ids(&sim, "Pool-A")[0].clone();
        assert!(set.belongs(&node("n0", &id)).await.unwrap());
    }

    #[tokio::test]
    async fn belongs_rejects_unknown_instances() {
        let (_sim, set) = harness(spec("pool-a", 0, 5), 1);
        let err = set
            .belongs(&node("nx", "sim://pools/pool-x/instances/0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleSetError::UnknownInstance(_)));
    }

    #[tokio::test]
    async fn decrease_target_size_invalidates_instance_cache() {
        let (sim, set) = harness(spec("pool-a", 0, 5), 2);
        set.nodes().await.unwrap();
        assert_eq!(sim.calls().list_instances(), 1);

        set.decrease_target_size(1).await.unwrap();
        set.nodes().await.unwrap();
        assert_eq!(sim.calls().list_instances(), 2);
    }

    #[tokio::test]
    async fn decrease_target_size_of_zero_still_nudges_caches() {
        let (sim, set) = harness(spec("pool-a", 0, 5), 2);
        set.nodes().await.unwrap();
        assert_eq!(sim.calls().list_instances(), 1);

        set.decrease_target_size(0).await.unwrap();
        assert_eq!(set.target_size().await.unwrap(), 2);
        set.nodes().await.unwrap();
        assert_eq!(sim.calls().list_instances(), 2);
    }

    #[tokio::test]
    async fn template_reflects_group_metadata() {
        let (_sim, set) = harness(spec("pool-a", 0, 5), 1);
        let template = set.template_node_info().await.unwrap();
        assert_eq!(template.name, "pool-a");
        assert!(template.allocatable.cpu_millis > 0);
    }

    #[tokio::test]
    async fn template_without_instance_type_is_fatal() {
        let sim = Arc::new(SimCloud::new().with_group(GroupDescriptor {
            name: "pool-a".to_string(),
            capacity: 1,
            instance_type: None,
            labels: HashMap::new(),
            taints: Vec::new(),
        }));
        let groups = Arc::new(GroupCache::new(
            DEFAULT_SIZE_REFRESH_PERIOD,
            DEFAULT_CALL_DEADLINE,
        ));
        let provider: Arc<dyn CloudProvider> = sim.clone();
        let set = ScaleSet::new(spec("pool-a", 0, 5), provider, groups);

        let err = set.template_node_info().await.unwrap_err();
        assert!(matches!(
            err,
            ScaleSetError::Cloud(CloudError::Template { .. })
        ));
    }

    #[test]
    fn instance_cache_drops_empty_ids_and_maps_states() {
        let raw = vec![
            RawInstance {
                provider_id: String::new(),
                provisioning_state: "Deleting".to_string(),
            },
            RawInstance {
                provider_id: "/Pools/A/Instances/0".to_string(),
                provisioning_state: "Creating".to_string(),
            },
            RawInstance {
                provider_id: "/Pools/A/Instances/1".to_string(),
                provisioning_state: "Succeeded".to_string(),
            },
            RawInstance {
                provider_id: "/Pools/A/Instances/2".to_string(),
                provisioning_state: "Deleting".to_string(),
            },
        ];
        let cache = build_instance_cache("sim", raw);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache[0].state, InstanceState::Creating);
        assert_eq!(cache[1].state, InstanceState::Running);
        assert_eq!(cache[2].state, InstanceState::Deleting);
        assert_eq!(cache[0].provider_id, "sim://pools/a/instances/0");
    }
}
