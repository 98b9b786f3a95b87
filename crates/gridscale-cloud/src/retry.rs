//! Retry with exponential backoff and jitter for transient backend faults.
//!
//! Throttled errors never retry here: the caller's cache-deferral strategy
//! handles them. Each operation gets a wall-clock budget so a flapping
//! backend cannot pin a tick indefinitely.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::error::RetryClass;

/// Backoff parameters for one logical operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub multiplier: f64,
    /// Ceiling on the per-attempt delay.
    pub max_delay: Duration,
    /// Total wall-clock budget for the operation including sleeps.
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            budget: Duration::from_secs(300),
        }
    }
}

/// Run `operation` until it succeeds, fails non-retryably, or the budget
/// would be exceeded by the next sleep. Jitter is uniform in 0.5x..1.5x of
/// the current delay.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClass + Display,
{
    let started = Instant::now();
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let sleep = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                if started.elapsed() + sleep > policy.budget {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "retry budget exhausted"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = sleep.as_millis() as u64,
                    "backend call failed, retrying"
                );
                tokio::time::sleep(sleep).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.multiplier)
                        .min(policy.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
