// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The resilience gate: circuit breaker, token bucket, and concurrency
//! limiter composed in that fixed order.
//!
//! Admission consults the three checks in sequence and stops at the first
//! rejection; state acquired by earlier checks is not rolled back. The
//! breaker's failure counter only advances on protected-operation failures,
//! never on admission rejections.
//!
//! A successful admission yields a [`GatePermit`]. The permit records the
//! operation outcome on the breaker and frees the concurrency slot on drop,
//! so release runs on every exit path including cancellation. A permit
//! dropped without an explicit outcome counts as a failure: the only way to
//! drop one unsettled is abandoning an admitted operation mid-flight.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::GatewayError;

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::concurrency::{BackpressureMode, ConcurrencyLimiter, SlotPermit};
use super::rate_limit::RateLimiter;

/// Configuration for the [`ConnectionGate`].
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub half_open_timeout: Duration,
    pub max_requests_per_second: u64,
    pub max_concurrent_connections: u32,
    pub backpressure_mode: BackpressureMode,
    pub backpressure_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(10),
            max_requests_per_second: 1000,
            max_concurrent_connections: 100,
            backpressure_mode: BackpressureMode::Drop,
            backpressure_timeout: Duration::ZERO,
        }
    }
}

impl From<&RuntimeConfig> for GateConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_failures: config.circuit_breaker_max_failures,
            reset_timeout: config.circuit_breaker_reset_timeout,
            half_open_timeout: config.circuit_breaker_half_open_timeout,
            max_requests_per_second: config.max_requests_per_second,
            max_concurrent_connections: config.max_concurrent_connections,
            backpressure_mode: config.backpressure_mode,
            backpressure_timeout: config.backpressure_timeout,
        }
    }
}

/// Admission gate in front of the database path.
pub struct ConnectionGate {
    circuit_breaker: Arc<CircuitBreaker>,
    rate_limiter: RateLimiter,
    concurrency: ConcurrencyLimiter,
}

impl ConnectionGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            circuit_breaker: Arc::new(CircuitBreaker::new(
                config.max_failures,
                config.reset_timeout,
                config.half_open_timeout,
            )),
            rate_limiter: RateLimiter::new(config.max_requests_per_second),
            concurrency: ConcurrencyLimiter::new(
                config.max_concurrent_connections,
                config.backpressure_mode,
                config.backpressure_timeout,
            ),
        }
    }

    /// Build a gate whose breaker carries a state-change hook.
    pub fn with_breaker(config: GateConfig, breaker: CircuitBreaker) -> Self {
        Self {
            circuit_breaker: Arc::new(breaker),
            rate_limiter: RateLimiter::new(config.max_requests_per_second),
            concurrency: ConcurrencyLimiter::new(
                config.max_concurrent_connections,
                config.backpressure_mode,
                config.backpressure_timeout,
            ),
        }
    }

    /// Run the three admission checks: breaker, then token bucket, then
    /// concurrency slot. A rejection at any step surfaces immediately.
    pub async fn acquire(&self) -> Result<GatePermit, GatewayError> {
        self.circuit_breaker.allow()?;
        self.rate_limiter.allow()?;
        let slot = self.concurrency.acquire().await?;

        Ok(GatePermit {
            _slot: slot,
            breaker: self.circuit_breaker.clone(),
            settled: false,
        })
    }

    /// Execute an operation under the gate.
    ///
    /// A gate rejection returns without invoking `op` (and without a
    /// release, since nothing was acquired). An admitted operation records
    /// success or failure on the breaker and always releases its slot.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let permit = self.acquire().await?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(err)
            }
        }
    }

    /// Current circuit breaker state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    /// Operations currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.concurrency.in_flight()
    }

    /// Current token count in the rate limiter (monitoring only).
    #[must_use]
    pub fn rate_tokens(&self) -> u64 {
        self.rate_limiter.tokens()
    }
}

impl std::fmt::Debug for ConnectionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGate")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Proof of admission. Exactly one of [`success`](GatePermit::success) /
/// [`failure`](GatePermit::failure) should be called; dropping an unsettled
/// permit records a failure (the operation was abandoned after admission).
pub struct GatePermit {
    _slot: SlotPermit,
    breaker: Arc<CircuitBreaker>,
    settled: bool,
}

impl GatePermit {
    /// Record operation success and release the slot.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Record operation failure and release the slot.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure();
        }
    }
}
