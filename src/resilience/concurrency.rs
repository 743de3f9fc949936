// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded-concurrency limiter with selectable backpressure behaviour.
//!
//! A semaphore of capacity `max_in_flight` bounds both the running
//! operations and the waiting queue: waiters are tasks that have already
//! arrived, never buffered requests. Slots release on drop, so every exit
//! path (including cancellation) frees its slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::GatewayError;

/// Behaviour when the concurrency limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Reject immediately.
    #[default]
    Drop,
    /// Wait for a slot until the caller cancels.
    Block,
    /// Wait up to the configured timeout, then reject.
    Timeout,
}

impl std::fmt::Display for BackpressureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drop => write!(f, "drop"),
            Self::Block => write!(f, "block"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// One unit of the limiter's capacity. Dropping the permit frees the slot.
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicU64>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let now = self.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        crate::metrics::set_in_flight(now);
    }
}

/// Limits concurrent in-flight operations.
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicU64>,
    max_in_flight: u32,
    mode: BackpressureMode,
    wait_timeout: Duration,
}

impl ConcurrencyLimiter {
    /// Zero `max_in_flight` falls back to 100.
    pub fn new(max_in_flight: u32, mode: BackpressureMode, wait_timeout: Duration) -> Self {
        let max_in_flight = if max_in_flight == 0 { 100 } else { max_in_flight };
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight as usize)),
            in_flight: Arc::new(AtomicU64::new(0)),
            max_in_flight,
            mode,
            wait_timeout,
        }
    }

    /// Acquire one slot according to the backpressure mode.
    ///
    /// Cancelling the returned future while waiting leaves the limiter
    /// untouched; once a permit is returned the slot is held until the
    /// permit drops.
    pub async fn acquire(&self) -> Result<SlotPermit, GatewayError> {
        let permit = match self.mode {
            BackpressureMode::Drop => self
                .semaphore
                .clone()
                .try_acquire_owned()
                .map_err(|_| self.rejected())?,
            BackpressureMode::Block => self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| self.rejected())?,
            BackpressureMode::Timeout => {
                if self.wait_timeout.is_zero() {
                    // No wait budget configured: behave like drop
                    self.semaphore
                        .clone()
                        .try_acquire_owned()
                        .map_err(|_| self.rejected())?
                } else {
                    match tokio::time::timeout(
                        self.wait_timeout,
                        self.semaphore.clone().acquire_owned(),
                    )
                    .await
                    {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) | Err(_) => return Err(self.rejected()),
                    }
                }
            }
        };

        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        crate::metrics::set_in_flight(now);
        Ok(SlotPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    fn rejected(&self) -> GatewayError {
        crate::metrics::record_gate_rejection("connection_limit");
        GatewayError::ConnectionLimitExceeded
    }

    /// Operations currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Configured capacity.
    #[must_use]
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("max_in_flight", &self.max_in_flight)
            .field("in_flight", &self.in_flight())
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drop_mode_rejects_when_full() {
        let limiter = ConcurrencyLimiter::new(2, BackpressureMode::Drop, Duration::ZERO);
        let _a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 2);

        let third = limiter.acquire().await;
        assert!(matches!(third, Err(GatewayError::ConnectionLimitExceeded)));
    }

    #[tokio::test]
    async fn test_release_frees_slot() {
        let limiter = ConcurrencyLimiter::new(1, BackpressureMode::Drop, Duration::ZERO);
        {
            let _permit = limiter.acquire().await.unwrap();
            assert_eq!(limiter.in_flight(), 1);
        }
        assert_eq!(limiter.in_flight(), 0);
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_block_mode_waits_for_slot() {
        let limiter = Arc::new(ConcurrencyLimiter::new(
            1,
            BackpressureMode::Block,
            Duration::ZERO,
        ));
        let permit = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
            })
        };

        // Give the waiter time to park, then free the slot
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(permit);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should run after release")
            .unwrap();
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_timeout_mode_expires() {
        let limiter = Arc::new(ConcurrencyLimiter::new(
            1,
            BackpressureMode::Timeout,
            Duration::from_millis(50),
        ));
        let _permit = limiter.acquire().await.unwrap();

        let start = std::time::Instant::now();
        let second = limiter.acquire().await;
        assert!(matches!(second, Err(GatewayError::ConnectionLimitExceeded)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_timeout_mode_succeeds_when_slot_frees_in_time() {
        let limiter = Arc::new(ConcurrencyLimiter::new(
            1,
            BackpressureMode::Timeout,
            Duration::from_millis(500),
        ));
        let permit = limiter.acquire().await.unwrap();

        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire().await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(permit);

        waiter.await.unwrap().expect("slot freed within timeout");
    }

    #[tokio::test]
    async fn test_timeout_mode_zero_budget_acts_like_drop() {
        let limiter = ConcurrencyLimiter::new(1, BackpressureMode::Timeout, Duration::ZERO);
        let _permit = limiter.acquire().await.unwrap();
        assert!(limiter.acquire().await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_slot() {
        let limiter = Arc::new(ConcurrencyLimiter::new(
            1,
            BackpressureMode::Block,
            Duration::ZERO,
        ));
        let permit = limiter.acquire().await.unwrap();

        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move {
            let _ = limiter2.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(permit);
        assert_eq!(limiter.in_flight(), 0);
        assert!(limiter.acquire().await.is_ok());
    }

    #[test]
    fn test_mode_deserialize() {
        let mode: BackpressureMode = serde_json::from_str("\"block\"").unwrap();
        assert_eq!(mode, BackpressureMode::Block);
        assert_eq!(BackpressureMode::default(), BackpressureMode::Drop);
    }
}
