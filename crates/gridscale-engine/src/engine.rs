//! The scaling decision loop.
//!
//! One tick: snapshot the cluster, gather eligible groups, plan and apply
//! scale-ups, then retire unneeded nodes. Errors demote a group for the
//! tick (throttle, transient) or for the process lifetime (fatal) but never
//! abort the loop. Shutdown is honored at tick boundaries only.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use gridscale_cloud::{retry_with_backoff, CloudError, RetryClass, RetryPolicy};
use gridscale_core::{ExpanderStrategy, NodeRecord, PodSpec};
use gridscale_scaleset::{ScaleSet, ScaleSetError};

use crate::counters::CounterBoard;
use crate::planner::{plan_scale_up, FreeCapacity, GroupInfo};
use crate::scale_down::{node_utilization, pods_fit_elsewhere, UnneededTracker};
use crate::snapshot::ClusterSnapshot;
use crate::status::GroupStatusBoard;

/// Tunables of the decision loop.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub scan_interval: Duration,
    pub scale_down_enabled: bool,
    pub scale_down_unneeded_time: Duration,
    pub scale_down_utilization_threshold: f64,
    pub max_concurrent_drain: u32,
    pub expander: ExpanderStrategy,
    pub cordon_node_before_terminating: bool,
    pub cooldown: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            scale_down_enabled: true,
            scale_down_unneeded_time: Duration::from_secs(600),
            scale_down_utilization_threshold: 0.5,
            max_concurrent_drain: 10,
            expander: ExpanderStrategy::Random,
            cordon_node_before_terminating: false,
            cooldown: Duration::from_secs(180),
        }
    }
}

/// The periodic reconciler over all registered scale sets.
pub struct Engine {
    snapshot: Arc<dyn ClusterSnapshot>,
    scale_sets: Vec<Arc<ScaleSet>>,
    /// Lowercased group name → driver.
    sets_by_name: HashMap<String, Arc<ScaleSet>>,
    options: EngineOptions,
    status: GroupStatusBoard,
    unneeded: UnneededTracker,
    counters: Arc<CounterBoard>,
    retry: RetryPolicy,
}

impl Engine {
    pub fn new(
        snapshot: Arc<dyn ClusterSnapshot>,
        scale_sets: Vec<Arc<ScaleSet>>,
        options: EngineOptions,
    ) -> Self {
        let sets_by_name = scale_sets
            .iter()
            .map(|s| (s.name().to_ascii_lowercase(), s.clone()))
            .collect();
        let status = GroupStatusBoard::new(options.cooldown);
        Self {
            snapshot,
            scale_sets,
            sets_by_name,
            options,
            status,
            unneeded: UnneededTracker::new(),
            counters: Arc::new(CounterBoard::new()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn counters(&self) -> Arc<CounterBoard> {
        self.counters.clone()
    }

    /// Run the loop until shutdown. Cancellation takes effect at tick
    /// boundaries.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.options.scan_interval.as_secs(),
            groups = self.scale_sets.len(),
            "decision loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.options.scan_interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("decision loop shutting down");
                    break;
                }
            }
        }
    }

    /// One reconciliation pass.
    pub async fn tick(&mut self) {
        let now = Instant::now();
        let pending = self.snapshot.pending_pods().await;
        let nodes = self.snapshot.nodes().await;

        let infos = self.gather_group_infos(now).await;
        let scaled_up = self.apply_scale_up(&pending, &infos, now).await;

        if self.options.scale_down_enabled {
            self.apply_scale_down(&nodes, &scaled_up, now).await;
        }

        debug!(
            pending = pending.len(),
            nodes = nodes.len(),
            groups = infos.len(),
            "tick complete"
        );
    }

    // ── Scale-up ───────────────────────────────────────────────────

    /// Groups eligible this tick, with a fresh template and size for each.
    async fn gather_group_infos(&mut self, now: Instant) -> Vec<GroupInfo> {
        let mut infos = Vec::new();

        for set in &self.scale_sets {
            let name = set.name().to_string();
            if !self.status.is_healthy(&name) {
                continue;
            }
            if !self.status.is_ready(&name, now) {
                debug!(group = %name, "group cooling down, skipping tick");
                continue;
            }
            let counters = self.counters.group(&name);

            let template = match set.template_node_info().await {
                Ok(template) => template,
                Err(e) if e.is_throttled() => {
                    counters.throttle_events.fetch_add(1, Ordering::Relaxed);
                    warn!(group = %name, error = %e, "throttled, skipping group this tick");
                    continue;
                }
                Err(e) if is_fatal(&e) => {
                    counters.fatal_errors.fetch_add(1, Ordering::Relaxed);
                    error!(group = %name, error = %e, "cannot derive node template");
                    self.status.mark_unhealthy(&name);
                    continue;
                }
                Err(e) => {
                    warn!(group = %name, error = %e, "template unavailable, skipping group this tick");
                    continue;
                }
            };

            let current = match set.target_size().await {
                Ok(n) => n,
                Err(ScaleSetError::NotInitialized(_)) => {
                    debug!(group = %name, "group initializing, skipping tick");
                    continue;
                }
                Err(e) if e.is_throttled() => {
                    counters.throttle_events.fetch_add(1, Ordering::Relaxed);
                    warn!(group = %name, error = %e, "throttled, skipping group this tick");
                    continue;
                }
                Err(e) if is_fatal(&e) => {
                    counters.fatal_errors.fetch_add(1, Ordering::Relaxed);
                    error!(group = %name, error = %e, "cannot read group size");
                    self.status.mark_unhealthy(&name);
                    continue;
                }
                Err(e) => {
                    warn!(group = %name, error = %e, "size unavailable, skipping group this tick");
                    continue;
                }
            };

            infos.push(GroupInfo {
                name,
                current,
                max_size: set.max_size(),
                priority: set.priority(),
                template,
            });
        }

        infos
    }

    /// Apply the scale-up plan; returns lowercased names of groups that
    /// grew, which are exempt from scale-down for the rest of the tick.
    async fn apply_scale_up(
        &mut self,
        pending: &[PodSpec],
        infos: &[GroupInfo],
        now: Instant,
    ) -> HashSet<String> {
        let mut scaled = HashSet::new();
        if pending.is_empty() || infos.is_empty() {
            return scaled;
        }

        let plan = plan_scale_up(pending, infos, self.options.expander);
        if !plan.unschedulable.is_empty() {
            warn!(
                pods = plan.unschedulable.len(),
                "pending pods no group can accommodate"
            );
        }

        for (group, delta) in &plan.deltas {
            let key = group.to_ascii_lowercase();
            let Some(set) = self.sets_by_name.get(&key).cloned() else {
                continue;
            };
            let counters = self.counters.group(group);
            counters.scale_up_attempts.fetch_add(1, Ordering::Relaxed);
            self.status.note_scaling(group);

            let result =
                retry_with_backoff(&self.retry, "scale-up", || set.increase_size(*delta)).await;
            match result {
                Ok(()) => {
                    counters.scale_up_successes.fetch_add(1, Ordering::Relaxed);
                    self.status.note_scaled(group, now);
                    scaled.insert(key);
                    info!(%group, delta, "scaled up");
                }
                Err(e) if e.is_throttled() => {
                    counters.throttle_events.fetch_add(1, Ordering::Relaxed);
                    self.status.note_done(group);
                    warn!(%group, error = %e, "scale-up throttled, skipping group this tick");
                }
                Err(e) if is_fatal(&e) => {
                    counters.fatal_errors.fetch_add(1, Ordering::Relaxed);
                    error!(%group, error = %e, "scale-up rejected");
                    self.status.mark_unhealthy(group);
                }
                Err(e) => {
                    self.status.note_done(group);
                    warn!(%group, error = %e, "scale-up failed");
                }
            }
        }

        scaled
    }

    // ── Scale-down ─────────────────────────────────────────────────

    async fn apply_scale_down(
        &mut self,
        nodes: &[NodeRecord],
        scaled_up: &HashSet<String>,
        now: Instant,
    ) {
        let ready: Vec<&NodeRecord> = nodes
            .iter()
            .filter(|n| n.ready && !n.unschedulable)
            .collect();

        let mut pods_by_node: HashMap<String, Vec<PodSpec>> = HashMap::new();
        for &node in &ready {
            let pods = self.snapshot.pods_on_node(&node.name).await;
            let utilization = node_utilization(node, &pods);
            self.unneeded.observe(
                &node.name,
                utilization < self.options.scale_down_utilization_threshold,
                now,
            );
            pods_by_node.insert(node.name.clone(), pods);
        }
        let present: Vec<&str> = ready.iter().map(|n| n.name.as_str()).collect();
        self.unneeded.retain_nodes(&present);

        let candidates = self
            .unneeded
            .unneeded(self.options.scale_down_unneeded_time, now);
        if candidates.is_empty() {
            return;
        }

        // Spare capacity of the nodes that would remain; each accepted
        // candidate's pods are deducted from it.
        let candidate_set: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        let mut headroom: Vec<FreeCapacity> = ready
            .iter()
            .filter(|n| !candidate_set.contains(n.name.as_str()))
            .map(|&n| {
                remaining_headroom(
                    n,
                    pods_by_node.get(&n.name).map(Vec::as_slice).unwrap_or(&[]),
                )
            })
            .collect();

        let mut batches: BTreeMap<String, Vec<NodeRecord>> = BTreeMap::new();
        let mut drained = 0u32;
        for name in &candidates {
            if drained >= self.options.max_concurrent_drain {
                debug!(cap = self.options.max_concurrent_drain, "drain cap reached");
                break;
            }
            let Some(&node) = ready.iter().find(|n| n.name == *name) else {
                continue;
            };
            let Some(group) = self.snapshot.node_group_for_node(node).await else {
                debug!(node = %name, "node has no known group, skipping");
                continue;
            };
            let key = group.to_ascii_lowercase();
            if scaled_up.contains(&key) || !self.sets_by_name.contains_key(&key) {
                continue;
            }
            let pods = pods_by_node.get(name.as_str()).cloned().unwrap_or_default();
            if !pods_fit_elsewhere(&pods, &mut headroom) {
                debug!(node = %name, "pods cannot be rescheduled elsewhere, keeping node");
                continue;
            }
            batches.entry(key).or_default().push(node.clone());
            drained += 1;
        }

        for (key, batch) in batches {
            let set = self.sets_by_name[&key].clone();
            let group = set.name().to_string();
            if !self.status.is_ready(&group, now) {
                continue;
            }
            let counters = self.counters.group(&group);
            for _ in &batch {
                counters.scale_down_attempts.fetch_add(1, Ordering::Relaxed);
            }

            if self.options.cordon_node_before_terminating {
                for node in &batch {
                    if let Err(e) = self.snapshot.cordon_node(&node.name).await {
                        warn!(node = %node.name, error = %e, "cordon failed");
                    }
                }
            }

            self.status.note_scaling(&group);
            let result =
                retry_with_backoff(&self.retry, "scale-down", || set.delete_nodes(&batch)).await;
            match result {
                Ok(()) => {
                    for node in &batch {
                        counters.scale_down_successes.fetch_add(1, Ordering::Relaxed);
                        self.unneeded.forget(&node.name);
                    }
                    self.status.note_scaled(&group, now);
                    info!(%group, nodes = batch.len(), "scaled down");
                }
                Err(e) if e.is_throttled() => {
                    counters.throttle_events.fetch_add(1, Ordering::Relaxed);
                    self.status.note_done(&group);
                    warn!(%group, error = %e, "scale-down throttled, skipping group this tick");
                }
                Err(ScaleSetError::MinSizeReached(_)) => {
                    self.status.note_done(&group);
                    debug!(%group, "at minimum size, nodes kept");
                }
                Err(e) if is_fatal(&e) => {
                    counters.fatal_errors.fetch_add(1, Ordering::Relaxed);
                    error!(%group, error = %e, "scale-down rejected");
                    self.status.mark_unhealthy(&group);
                }
                Err(e) => {
                    self.status.note_done(&group);
                    warn!(%group, error = %e, "scale-down failed");
                }
            }
        }
    }
}

/// Errors that exclude a group until restart.
fn is_fatal(e: &ScaleSetError) -> bool {
    match e {
        ScaleSetError::Cloud(cloud) => matches!(
            cloud,
            CloudError::Rejected(_)
                | CloudError::UnknownGroup(_)
                | CloudError::MalformedId(_)
                | CloudError::Template { .. }
        ),
        _ => false,
    }
}

/// Headroom a node would contribute as a rescheduling target.
fn remaining_headroom(node: &NodeRecord, pods: &[PodSpec]) -> FreeCapacity {
    let cpu_used: u64 = pods.iter().map(|p| p.requests.cpu_millis).sum();
    let memory_used: u64 = pods.iter().map(|p| p.requests.memory_bytes).sum();
    let gpu_used: u64 = pods.iter().map(|p| p.requests.gpu_count).sum();

    FreeCapacity {
        cpu_millis: node.allocatable.cpu_millis.saturating_sub(cpu_used),
        memory_bytes: node.allocatable.memory_bytes.saturating_sub(memory_used),
        gpu_count: node.allocatable.gpu_count.saturating_sub(gpu_used),
        pod_slots: node.allocatable.pods.saturating_sub(pods.len() as u32),
    }
}
