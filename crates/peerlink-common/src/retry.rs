//! Retry helpers for calls against the record store.
//!
//! Two flavours are provided:
//!
//! - [`retry_with_backoff`] retries any fallible async operation with
//!   exponential backoff and jitter. Used for transient API failures.
//! - [`retry_on_conflict`] re-runs a read-modify-write closure only when it
//!   fails with a version conflict, up to a small bound. Anything else is
//!   returned to the caller immediately.
//!
//! ```ignore
//! use peerlink_common::retry::{retry_on_conflict, RetryConfig};
//!
//! retry_on_conflict(&RetryConfig::conflict(), "update_tep_status", || async {
//!     let mut tep = store.get_tunnel_endpoint(ns, name).await?;
//!     tep.status = Some(new_status.clone());
//!     store.replace_tunnel_endpoint_status(&tep).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Short, bounded schedule for optimistic-concurrency retries
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

fn jittered(delay: Duration) -> Duration {
    // 0.5x to 1.5x of the delay
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success or until `max_attempts` is reached, in which case
/// the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let wait = jittered(delay);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = wait.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(wait).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Re-run a read-modify-write operation while it fails with [`Error::Conflict`].
///
/// The closure must re-read the record on every invocation so the mutation is
/// applied to the latest version. Non-conflict errors are returned at once.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        "Giving up after repeated version conflicts"
                    );
                    return Err(e);
                }
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    "Version conflict, re-reading and retrying"
                );
                tokio::time::sleep(jittered(delay)).await;
                delay = config.next_delay(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Per-object requeue delays for controller error policies.
///
/// Each consecutive failure of the same key doubles the delay up to `max`.
/// A successful reconcile calls [`RequeueBackoff::reset`].
#[derive(Debug)]
pub struct RequeueBackoff {
    base: Duration,
    max: Duration,
    failures: std::sync::Mutex<std::collections::HashMap<String, u32>>,
}

impl Default for RequeueBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl RequeueBackoff {
    /// Backoff starting at `base` and capped at `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Record a failure of `key` and return the delay before the next attempt
    pub fn next(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = (*count).min(16);
        *count = count.saturating_add(1);
        self.base
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }

    /// Forget the failures of `key`
    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}
