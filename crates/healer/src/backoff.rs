//! Exponential backoff for individual collaborator calls.
//!
//! Wraps single RPCs (log fetch, codegen, branch/commit, redeploy, status
//! poll). It is unrelated to the orchestrator's attempt budget, which counts
//! whole remediation iterations.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::HealerError;

/// Failures that know whether they are worth retrying.
pub trait Retryable {
    /// Transient failure that may succeed on a later attempt.
    fn is_retryable(&self) -> bool;
}

impl Retryable for HealerError {
    fn is_retryable(&self) -> bool {
        HealerError::is_retryable(self)
    }
}

/// Retry configuration for collaborator calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first call (total calls = `max_retries + 1`)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Configuration without a delay cap.
    #[must_use]
    pub fn uncapped(max_retries: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms: u64::MAX,
        }
    }

    /// Delay after failed attempt `attempt` (0-indexed): `initial * 2^attempt`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt);
        let millis = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Run `operation`, retrying transient failures with exponential backoff.
    ///
    /// Non-retryable failures, and retryable failures on the final attempt,
    /// are returned immediately.
    pub async fn run<T, E, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = operation_name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_retries => {
                    warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        "Giving up after retryable failure: {e}"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        "Transient failure: {e}. Retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Run `operation` with `max_retries` retries starting at `initial_delay_ms`.
pub async fn run_with_backoff<T, E, F, Fut>(
    operation: F,
    max_retries: u32,
    initial_delay_ms: u64,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    RetryConfig::uncapped(max_retries, initial_delay_ms)
        .run("operation", operation)
        .await
}
