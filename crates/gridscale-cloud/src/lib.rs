//! gridscale-cloud — the narrow seam between the engine and any backend.
//!
//! The autoscaling core never inspects vendor SDK types: it talks through
//! the [`CloudProvider`] trait, classifies failures with [`CloudError`]
//! predicates, and retries retryable calls under [`retry::RetryPolicy`].
//! Vendor adapters implement the trait; [`sim::SimCloud`] is the built-in
//! in-memory backend used by tests and by the daemon's simulation mode.

pub mod error;
pub mod provider;
pub mod retry;
pub mod sim;
pub mod template;

pub use error::{with_deadline, CloudError, CloudResult, RetryClass};
pub use provider::{normalize_provider_id, CloudProvider, MutationHandle, MutationKind, RawInstance};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use sim::SimCloud;
pub use template::build_template_node;
