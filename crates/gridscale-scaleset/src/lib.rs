//! gridscale-scaleset — the per-group driver.
//!
//! A [`ScaleSet`] owns the cached view of one node group: its last observed
//! size, its instance list, and the in-flight mutation observers that keep
//! both honest. The process-wide [`GroupCache`] holds the descriptors from
//! the last backend list call and is shared by every driver.

pub mod error;
pub mod group_cache;
pub mod scale_set;

pub use error::{ScaleSetError, ScaleSetResult};
pub use group_cache::GroupCache;
pub use scale_set::ScaleSet;
