//! Backend error taxonomy.
//!
//! Backends must map "too many requests" to [`CloudError::Throttled`]
//! rather than retrying it at the transport layer: the driver wants the
//! explicit throttle signal so its cache-deferral strategy can take effect.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for backend operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors surfaced by a cloud backend.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The backend asked the client to reduce request rate.
    #[error("backend throttled the request: {0}")]
    Throttled(String),

    /// Connection failure, 5xx, or other recoverable fault.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// A call exceeded its deadline.
    #[error("backend call exceeded deadline of {0:?}")]
    Timeout(Duration),

    /// The backend refused the mutation outright.
    #[error("backend rejected the operation: {0}")]
    Rejected(String),

    /// The group does not exist on the backend.
    #[error("unknown node group: {0}")]
    UnknownGroup(String),

    /// A provider id that cannot be resolved to a group.
    #[error("malformed provider id: {0}")]
    MalformedId(String),

    /// No node template can be derived for the group.
    #[error("cannot derive node template for group {group}: {reason}")]
    Template { group: String, reason: String },
}

/// Classification of errors for retry decisions, implemented by every error
/// type that wraps backend failures.
pub trait RetryClass {
    /// Rate-limit signal; never retried, recovered by serving stale cache.
    fn is_throttled(&self) -> bool;

    /// Worth retrying with backoff.
    fn is_retryable(&self) -> bool;
}

impl RetryClass for CloudError {
    fn is_throttled(&self) -> bool {
        matches!(self, CloudError::Throttled(_))
    }

    fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Transient(_) | CloudError::Timeout(_))
    }
}

/// Run a backend call under a per-call deadline.
///
/// An elapsed deadline maps to [`CloudError::Timeout`]; the call's partial
/// work is abandoned and no local state is touched.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> CloudResult<T>
where
    F: Future<Output = CloudResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(CloudError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttled_is_not_retryable() {
        let err = CloudError::Throttled("429".to_string());
        assert!(err.is_throttled());
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_and_timeout_are_retryable() {
        assert!(CloudError::Transient("connection reset".to_string()).is_retryable());
        assert!(CloudError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn fatal_errors_are_neither() {
        for err in [
            CloudError::Rejected("bad request".to_string()),
            CloudError::UnknownGroup("pool-a".to_string()),
            CloudError::MalformedId("???".to_string()),
        ] {
            assert!(!err.is_throttled());
            assert!(!err.is_retryable());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses_into_timeout() {
        let result: CloudResult<()> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CloudError::Timeout(_))));
    }

    #[tokio::test]
    async fn deadline_passes_results_through() {
        let result = with_deadline(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
