//! Process-wide cache of node-group descriptors.
//!
//! One map covering every group the backend reported on the last list call,
//! with a single timestamp for the whole map. Whichever scale set first
//! observes it stale refreshes it for everyone. The internal lock is never
//! held across the backend call.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use gridscale_cloud::{with_deadline, CloudError, CloudProvider, CloudResult};
use gridscale_core::GroupDescriptor;

#[derive(Default)]
struct Inner {
    /// Keys are lowercased group names.
    groups: HashMap<String, GroupDescriptor>,
    last_refresh: Option<Instant>,
}

/// Shared descriptor cache, injected into every [`crate::ScaleSet`].
pub struct GroupCache {
    refresh_period: Duration,
    call_deadline: Duration,
    inner: Mutex<Inner>,
}

impl GroupCache {
    pub fn new(refresh_period: Duration, call_deadline: Duration) -> Self {
        Self {
            refresh_period,
            call_deadline,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The last-observed descriptor for a group, refreshing the whole map
    /// first when it has gone stale or the group is missing from it.
    pub async fn describe(
        &self,
        provider: &dyn CloudProvider,
        name: &str,
    ) -> CloudResult<GroupDescriptor> {
        let key = name.to_ascii_lowercase();

        {
            let inner = self.inner.lock().await;
            if let Some(last) = inner.last_refresh {
                if last.elapsed() < self.refresh_period {
                    if let Some(descriptor) = inner.groups.get(&key) {
                        return Ok(descriptor.clone());
                    }
                }
            }
        }

        // Lock released around the backend call.
        let listed = with_deadline(self.call_deadline, provider.list_groups()).await?;
        debug!(groups = listed.len(), "refreshed node-group cache");

        let mut inner = self.inner.lock().await;
        inner.groups = listed
            .into_iter()
            .map(|d| (d.name.to_ascii_lowercase(), d))
            .collect();
        inner.last_refresh = Some(Instant::now());
        inner
            .groups
            .get(&key)
            .cloned()
            .ok_or_else(|| CloudError::UnknownGroup(name.to_string()))
    }

    /// Drop freshness so the next `describe` re-lists from the backend.
    pub async fn invalidate(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_refresh = None;
    }
}
