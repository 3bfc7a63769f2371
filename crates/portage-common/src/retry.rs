//! Retry utilities for transient failures and version conflicts.
//!
//! Two families live here: a general-purpose jittered exponential backoff
//! for any async operation, and the record update loops that re-read a
//! record after a version conflict and re-apply the caller's mutation until
//! a deadline runs out. Conflicts are the only condition these loops absorb;
//! every other error surfaces immediately.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::crd::MoveRecord;
use crate::error::Error;
use crate::kube_utils::RecordStore;
use crate::Result;

/// Configuration for operations that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
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
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or until `max_attempts` is exhausted when set.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
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
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

enum UpdateTarget {
    Resource,
    Status,
}

/// Mutate a record's spec/metadata under conflict retry until `timeout`
pub async fn update_record_with_retry<R, F>(
    store: &dyn RecordStore<R>,
    name: &str,
    timeout: Duration,
    mutate: F,
) -> Result<R>
where
    R: MoveRecord + 'static,
    F: FnMut(&mut R) + Send,
{
    update_with_retry(store, name, timeout, mutate, UpdateTarget::Resource).await
}

/// Mutate a record's status under conflict retry until `timeout`
pub async fn update_status_with_retry<R, F>(
    store: &dyn RecordStore<R>,
    name: &str,
    timeout: Duration,
    mutate: F,
) -> Result<R>
where
    R: MoveRecord + 'static,
    F: FnMut(&mut R) + Send,
{
    update_with_retry(store, name, timeout, mutate, UpdateTarget::Status).await
}

async fn update_with_retry<R, F>(
    store: &dyn RecordStore<R>,
    name: &str,
    timeout: Duration,
    mut mutate: F,
    target: UpdateTarget,
) -> Result<R>
where
    R: MoveRecord + 'static,
    F: FnMut(&mut R) + Send,
{
    let deadline = Instant::now() + timeout;
    let mut delay = Duration::from_millis(100);

    loop {
        let mut record = store
            .get(name)
            .await?
            .ok_or_else(|| Error::internal_with_context("update", format!("{} is gone", name)))?;

        mutate(&mut record);

        let outcome = match target {
            UpdateTarget::Resource => store.replace(&record).await,
            UpdateTarget::Status => store.replace_status(&record).await,
        };

        match outcome {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() => {
                if Instant::now() + delay >= deadline {
                    return Err(Error::deadline(format!("updating {}", name)));
                }
                warn!(record = %name, delay_ms = delay.as_millis(), "update conflict, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(5));
            }
            Err(e) => return Err(e),
        }
    }
}
