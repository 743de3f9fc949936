// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff for transient database failures.
//!
//! Only errors classified retryable by [`GatewayError::is_retryable`] are
//! attempted again; gate rejections and statement errors surface
//! immediately. Backoff grows by `multiplier` per attempt, clamped to
//! `max_backoff`. Cancelling the caller's future aborts a backoff sleep
//! immediately.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::GatewayError;

/// Retry behaviour for a facade operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy from configured knobs; zero values keep the defaults.
    #[must_use]
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: if max_retries == 0 {
                defaults.max_retries
            } else {
                max_retries
            },
            initial_backoff: if initial_backoff.is_zero() {
                defaults.initial_backoff
            } else {
                initial_backoff
            },
            ..defaults
        }
    }

    /// Fast policy for tests (minimal delays).
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// Run `op` up to `max_retries + 1` times.
    ///
    /// The closure receives the attempt index (0-based). Non-retryable
    /// errors and gate rejections return unchanged; exhausting the budget
    /// wraps the last error in [`GatewayError::RetryExhausted`].
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                sleep(backoff).await;
                backoff = backoff.mul_f64(self.multiplier).min(self.max_backoff);
            }

            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            operation = operation_name,
                            attempt, "Operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if err.is_gate_rejection() => {
                    // Admission refusals are surfaced unchanged, never retried
                    return Err(err);
                }
                Err(err) if !err.is_retryable() => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        budget = self.max_retries + 1,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retryable operation failure"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(GatewayError::RetryExhausted {
            attempts: self.max_retries + 1,
            // last_err is always set when the loop falls through
            source: Box::new(last_err.unwrap_or(GatewayError::NotConnected)),
        })
    }
}
