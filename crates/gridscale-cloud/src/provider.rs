//! The cloud-provider interface.
//!
//! Everything the autoscaling core requires from an infrastructure backend.
//! Mutations are asynchronous on the backend side: `set_capacity` and
//! `delete_instances` return a [`MutationHandle`] that a detached observer
//! resolves with `await_mutation`.

use async_trait::async_trait;

use gridscale_core::GroupDescriptor;

use crate::error::CloudResult;

/// Instance row exactly as a backend list call returned it, before
/// normalization. An empty `provider_id` is the backend's signal that the
/// instance is mid-deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInstance {
    pub provider_id: String,
    pub provisioning_state: String,
}

/// Which kind of remote mutation a handle tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Resize,
    Delete,
}

/// Opaque handle to an in-flight remote mutation.
#[derive(Debug, Clone)]
pub struct MutationHandle {
    pub id: u64,
    pub group: String,
    pub kind: MutationKind,
}

/// Operations the engine requires from any infrastructure backend.
///
/// Implementations must surface rate limits as `CloudError::Throttled`
/// instead of retrying them internally.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Backend tag used as the provider-id scheme (e.g. `sim` in
    /// `sim://pools/a/instances/0`).
    fn name(&self) -> &str;

    /// Enumerate all node groups with their current descriptors.
    async fn list_groups(&self) -> CloudResult<Vec<GroupDescriptor>>;

    /// Resolve the owning group of an instance, or `None` when the id is
    /// well-formed but matches no known group.
    async fn group_of_instance(&self, provider_id: &str) -> CloudResult<Option<String>>;

    /// List the instances of one group.
    async fn list_instances(&self, group: &str) -> CloudResult<Vec<RawInstance>>;

    /// Ask the backend to move the group to the given target capacity.
    async fn set_capacity(&self, group: &str, capacity: u32) -> CloudResult<MutationHandle>;

    /// Ask the backend to delete specific instances of a group. The backend
    /// shrinks the group's capacity by the number deleted.
    async fn delete_instances(&self, group: &str, ids: &[String]) -> CloudResult<MutationHandle>;

    /// Block until the mutation behind the handle resolves.
    async fn await_mutation(&self, handle: MutationHandle) -> CloudResult<()>;
}

/// Canonical form of a provider id: the lowercased resource path prefixed
/// with the backend tag. Idempotent.
pub fn normalize_provider_id(tag: &str, raw: &str) -> String {
    let lowered = raw.to_ascii_lowercase();
    let prefix = format!("{tag}://");
    if lowered.starts_with(&prefix) {
        lowered
    } else {
        format!("{prefix}{}", lowered.trim_start_matches('/'))
    }
}
