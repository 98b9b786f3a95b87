//! Scale-up planning.
//!
//! Pending pods are packed onto simulated nodes built from each group's
//! template: a pod first tries the headroom of nodes the plan has already
//! added, and only when none fits does the expander pick a group for a new
//! node, within that group's maximum.

use std::collections::BTreeMap;

use tracing::debug;

use gridscale_core::{ExpanderStrategy, PodSpec, ResourceRequests, TemplateNode};

use crate::expander::{self, ExpansionOption};

/// Everything the planner needs to know about one eligible group.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub current: u32,
    pub max_size: u32,
    pub priority: i32,
    pub template: TemplateNode,
}

/// Remaining room on one already-planned (or existing) node.
#[derive(Debug, Clone)]
pub struct FreeCapacity {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpu_count: u64,
    pub pod_slots: u32,
}

impl FreeCapacity {
    /// Full headroom of a fresh template node.
    pub fn of_template(template: &TemplateNode) -> Self {
        Self {
            cpu_millis: template.allocatable.cpu_millis,
            memory_bytes: template.allocatable.memory_bytes,
            gpu_count: template.allocatable.gpu_count,
            pod_slots: template.allocatable.pods,
        }
    }

    pub fn fits(&self, requests: &ResourceRequests) -> bool {
        self.pod_slots > 0
            && self.cpu_millis >= requests.cpu_millis
            && self.memory_bytes >= requests.memory_bytes
            && self.gpu_count >= requests.gpu_count
    }

    /// Deduct a pod's requests; callers check `fits` first.
    pub fn deduct(&mut self, requests: &ResourceRequests) {
        self.cpu_millis -= requests.cpu_millis.min(self.cpu_millis);
        self.memory_bytes -= requests.memory_bytes.min(self.memory_bytes);
        self.gpu_count -= requests.gpu_count.min(self.gpu_count);
        self.pod_slots = self.pod_slots.saturating_sub(1);
    }
}

/// The outcome of one planning pass.
#[derive(Debug, Default)]
pub struct ScaleUpPlan {
    /// How many nodes each group should gain.
    pub deltas: BTreeMap<String, u32>,
    /// Pods no group could host, saturated groups included.
    pub unschedulable: Vec<String>,
}

/// Whether a brand-new node of this template could host the pod at all.
pub fn pod_fits_template(pod: &PodSpec, template: &TemplateNode) -> bool {
    let selector_matches = pod
        .node_selector
        .iter()
        .all(|(k, v)| template.labels.get(k) == Some(v));
    let taints_tolerated = template
        .taints
        .iter()
        .all(|taint| pod.tolerations.iter().any(|t| *t == taint.key));
    selector_matches && taints_tolerated && template.allocatable.covers(&pod.requests)
}

struct GroupPlanState<'a> {
    info: &'a GroupInfo,
    planned_nodes: Vec<FreeCapacity>,
}

/// Compute per-group scale-up deltas for the pending pods.
pub fn plan_scale_up(
    pods: &[PodSpec],
    groups: &[GroupInfo],
    strategy: ExpanderStrategy,
) -> ScaleUpPlan {
    let mut states: Vec<GroupPlanState> = groups
        .iter()
        .map(|info| GroupPlanState {
            info,
            planned_nodes: Vec::new(),
        })
        .collect();
    let mut plan = ScaleUpPlan::default();

    'pods: for pod in pods {
        // Reuse headroom on nodes this plan already pays for.
        for state in &mut states {
            if !pod_fits_template(pod, &state.info.template) {
                continue;
            }
            for free in &mut state.planned_nodes {
                if free.fits(&pod.requests) {
                    free.deduct(&pod.requests);
                    continue 'pods;
                }
            }
        }

        // A new node is needed; let the expander pick the group.
        let candidates: Vec<ExpansionOption> = states
            .iter()
            .filter(|s| {
                pod_fits_template(pod, &s.info.template)
                    && s.info.current + (s.planned_nodes.len() as u32) < s.info.max_size
            })
            .map(|s| ExpansionOption {
                group: s.info.name.clone(),
                priority: s.info.priority,
                template: s.info.template.clone(),
            })
            .collect();

        let Some(chosen) = expander::choose(strategy, pod, &candidates) else {
            debug!(pod = %pod.name, "no group can host pending pod");
            plan.unschedulable.push(pod.name.clone());
            continue;
        };

        let Some(state) = states.iter_mut().find(|s| s.info.name == chosen.group) else {
            continue;
        };
        let mut free = FreeCapacity::of_template(&state.info.template);
        free.deduct(&pod.requests);
        state.planned_nodes.push(free);
    }

    for state in states {
        let count = state.planned_nodes.len() as u32;
        if count > 0 {
            plan.deltas.insert(state.info.name.clone(), count);
        }
    }
    plan
}
