//! Synthetic node construction from group metadata.
//!
//! The decision loop simulates "would a new node of this group schedule
//! this pod?" against the template instead of creating a real node.
//! Building is deterministic for a fixed descriptor.

use std::collections::HashMap;

use gridscale_core::{GroupDescriptor, Resources, TemplateNode};

use crate::error::{CloudError, CloudResult};

/// Label every template carries so simulated nodes are attributable.
pub const GROUP_LABEL: &str = "gridscale.io/node-group";

/// CPU held back from allocatable for system daemons.
pub const SYSTEM_RESERVED_CPU_MILLIS: u64 = 100;

/// Memory held back from allocatable for system daemons.
pub const SYSTEM_RESERVED_MEMORY_BYTES: u64 = 100 * 1024 * 1024;

/// Pods-per-node ceiling applied when the backend reports none.
pub const DEFAULT_MAX_PODS: u32 = 110;

/// Derive a synthetic node from a group descriptor.
///
/// Fails with `CloudError::Template` when the descriptor carries no usable
/// instance-type metadata; the decision loop excludes such a group until
/// its configuration is corrected.
pub fn build_template_node(desc: &GroupDescriptor) -> CloudResult<TemplateNode> {
    let sku = desc.instance_type.as_ref().ok_or_else(|| CloudError::Template {
        group: desc.name.clone(),
        reason: "missing instance-type metadata".to_string(),
    })?;

    if sku.cpu_millis == 0 || sku.memory_bytes == 0 {
        return Err(CloudError::Template {
            group: desc.name.clone(),
            reason: format!(
                "instance type {} reports zero cpu or memory",
                sku.name
            ),
        });
    }

    let pods = if sku.max_pods == 0 { DEFAULT_MAX_PODS } else { sku.max_pods };

    let capacity = Resources {
        cpu_millis: sku.cpu_millis,
        memory_bytes: sku.memory_bytes,
        gpu_count: sku.gpu_count,
        ephemeral_storage_bytes: sku.ephemeral_storage_bytes,
        pods,
    };

    let allocatable = Resources {
        cpu_millis: capacity.cpu_millis.saturating_sub(SYSTEM_RESERVED_CPU_MILLIS),
        memory_bytes: capacity
            .memory_bytes
            .saturating_sub(SYSTEM_RESERVED_MEMORY_BYTES),
        ..capacity
    };

    let mut labels: HashMap<String, String> = desc.labels.clone();
    labels.insert(GROUP_LABEL.to_string(), desc.name.clone());

    Ok(TemplateNode {
        name: desc.name.clone(),
        labels,
        taints: desc.taints.clone(),
        capacity,
        allocatable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscale_core::InstanceTypeSpec;

    fn descriptor(instance_type: Option<InstanceTypeSpec>) -> GroupDescriptor {
        GroupDescriptor {
            name: "pool-a".to_string(),
            capacity: 2,
            instance_type,
            labels: HashMap::from([("zone".to_string(), "z1".to_string())]),
            taints: Vec::new(),
        }
    }

    fn sku() -> InstanceTypeSpec {
        InstanceTypeSpec {
            name: "standard-4".to_string(),
            cpu_millis: 4000,
            memory_bytes: 16 << 30,
            gpu_count: 0,
            ephemeral_storage_bytes: 100 << 30,
            max_pods: 30,
        }
    }

    #[test]
    fn template_carries_group_metadata() {
        let template = build_template_node(&descriptor(Some(sku()))).unwrap();
        assert_eq!(template.name, "pool-a");
        assert_eq!(template.labels.get("zone").unwrap(), "z1");
        assert_eq!(template.labels.get(GROUP_LABEL).unwrap(), "pool-a");
        assert_eq!(template.capacity.pods, 30);
    }

    #[test]
    fn allocatable_reserves_system_overhead() {
        let template = build_template_node(&descriptor(Some(sku()))).unwrap();
        assert_eq!(
            template.allocatable.cpu_millis,
            4000 - SYSTEM_RESERVED_CPU_MILLIS
        );
        assert_eq!(
            template.allocatable.memory_bytes,
            (16 << 30) - SYSTEM_RESERVED_MEMORY_BYTES
        );
        assert_eq!(template.allocatable.pods, template.capacity.pods);
    }

    #[test]
    fn missing_instance_type_is_fatal() {
        let err = build_template_node(&descriptor(None)).unwrap_err();
        assert!(matches!(err, CloudError::Template { .. }));
    }

    #[test]
    fn zero_cpu_is_fatal() {
        let mut bad = sku();
        bad.cpu_millis = 0;
        let err = build_template_node(&descriptor(Some(bad))).unwrap_err();
        assert!(matches!(err, CloudError::Template { .. }));
    }

    #[test]
    fn zero_max_pods_falls_back_to_default() {
        let mut no_pods = sku();
        no_pods.max_pods = 0;
        let template = build_template_node(&descriptor(Some(no_pods))).unwrap();
        assert_eq!(template.capacity.pods, DEFAULT_MAX_PODS);
    }

    #[test]
    fn building_is_deterministic() {
        let desc = descriptor(Some(sku()));
        assert_eq!(
            build_template_node(&desc).unwrap(),
            build_template_node(&desc).unwrap()
        );
    }
}
