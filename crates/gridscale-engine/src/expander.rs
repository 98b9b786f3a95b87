//! Group-selection strategies for scale-up.
//!
//! When several groups could host a pending pod, the configured expander
//! picks one. Ties resolve to the first candidate so plans stay
//! deterministic for everything but the random strategy.

use rand::Rng;

use gridscale_core::{ExpanderStrategy, PodSpec, TemplateNode};

/// One candidate group for a pending pod.
#[derive(Debug, Clone)]
pub struct ExpansionOption {
    pub group: String,
    /// Ranking from the group's configuration (priority strategy).
    pub priority: i32,
    pub template: TemplateNode,
}

/// Pick among candidate groups for the given pod.
pub fn choose<'a>(
    strategy: ExpanderStrategy,
    pod: &PodSpec,
    options: &'a [ExpansionOption],
) -> Option<&'a ExpansionOption> {
    if options.is_empty() {
        return None;
    }
    match strategy {
        ExpanderStrategy::Random => {
            let index = rand::thread_rng().gen_range(0..options.len());
            options.get(index)
        }
        ExpanderStrategy::MostPods => options
            .iter()
            .max_by_key(|o| o.template.allocatable.pods),
        ExpanderStrategy::LeastWaste => options.iter().min_by(|a, b| {
            waste(pod, &a.template)
                .partial_cmp(&waste(pod, &b.template))
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        ExpanderStrategy::Priority => options.iter().max_by_key(|o| o.priority),
    }
}

/// Fraction of a template node left idle by this pod, summed over the CPU
/// and memory dimensions.
fn waste(pod: &PodSpec, template: &TemplateNode) -> f64 {
    let cpu = ratio_left(pod.requests.cpu_millis, template.allocatable.cpu_millis);
    let memory = ratio_left(pod.requests.memory_bytes, template.allocatable.memory_bytes);
    cpu + memory
}

fn ratio_left(requested: u64, allocatable: u64) -> f64 {
    if allocatable == 0 {
        return 0.0;
    }
    1.0 - (requested.min(allocatable) as f64 / allocatable as f64)
}
