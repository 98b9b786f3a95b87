//! Scale-set driver error types.

use thiserror::Error;

use gridscale_cloud::{CloudError, RetryClass};

/// Result type alias for driver operations.
pub type ScaleSetResult<T> = Result<T, ScaleSetError>;

/// Errors surfaced by scale-set operations.
#[derive(Debug, Error)]
pub enum ScaleSetError {
    #[error("size change must be positive")]
    NonPositiveDelta,

    #[error("group {0} has no authoritative size yet")]
    NotInitialized(String),

    #[error("size {requested} exceeds maximum {max} for group {group}")]
    ExceedsMax {
        group: String,
        requested: u32,
        max: u32,
    },

    #[error("minimum size reached for group {0}, nodes will not be deleted")]
    MinSizeReached(String),

    #[error("instance {instance} does not belong to group {group}")]
    ForeignInstance { instance: String, group: String },

    #[error("instance {0} does not belong to any known group")]
    UnknownInstance(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

impl RetryClass for ScaleSetError {
    fn is_throttled(&self) -> bool {
        matches!(self, ScaleSetError::Cloud(e) if e.is_throttled())
    }

    fn is_retryable(&self) -> bool {
        matches!(self, ScaleSetError::Cloud(e) if e.is_retryable())
    }
}
