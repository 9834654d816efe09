//! Bounded retry with exponential backoff.
//!
//! Used at adapter boundaries (record store, remote participants, action
//! endpoints) so that transient I/O failures are absorbed before they reach
//! orchestration logic. Only errors for which [`Error::is_transient`] holds
//! are retried; everything else is returned on the first failure.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::humantime_serde;
use crate::error::{Error, Result};

/// Retry policy for a single logical call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(20)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff_for(attempt);
                    tracing::debug!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::warn!(op = op_name, attempts = attempt, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Translate an exhausted transient error into the caller-facing taxonomy.
pub fn exhausted(err: Error, what: &str) -> Error {
    if err.is_transient() {
        Error::Unavailable(format!("{what}: {err}"))
    } else {
        err
    }
}
