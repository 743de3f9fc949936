// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker with an explicit three-state machine.
//!
//! States:
//! - Closed: normal operation, requests pass through
//! - Open: downstream unhealthy, requests fail-fast without attempting
//! - HalfOpen: probing for recovery, requests allowed through
//!
//! Transitions:
//! - closed → open when a recorded failure reaches `max_failures`
//! - open → half-open on admission once `reset_timeout` has elapsed since
//!   the last failure (failure counter reset)
//! - half-open → closed on a recorded success
//! - half-open → open on any recorded failure
//!
//! The state word is atomic for cheap reads; transition sequences run under
//! a mutex so observers never see an out-of-order transition.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Hook invoked on every state transition with `(from, to)`.
pub type StateChangeHook = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// A circuit breaker protecting the database path.
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    // Reserved for scheduling a single half-open probe.
    #[allow(dead_code)]
    half_open_timeout: Duration,
    state: AtomicU8,
    failure_count: AtomicU32,
    last_failure: Mutex<Option<Instant>>,
    on_state_change: Option<StateChangeHook>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration, half_open_timeout: Duration) -> Self {
        Self {
            max_failures: if max_failures == 0 { 5 } else { max_failures },
            reset_timeout,
            half_open_timeout,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            last_failure: Mutex::new(None),
            on_state_change: None,
        }
    }

    /// Register a hook invoked on every state transition.
    #[must_use]
    pub fn with_state_change_hook(mut self, hook: StateChangeHook) -> Self {
        self.on_state_change = Some(hook);
        self
    }

    /// Current state. Reads may lag a concurrent transition but never
    /// observe an impossible one.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Check whether an operation may proceed.
    ///
    /// In `open`, transitions to `half-open` once `reset_timeout` has
    /// elapsed since the last failure; otherwise rejects.
    pub fn allow(&self) -> Result<(), crate::error::GatewayError> {
        match self.state() {
            CircuitState::Open => {
                let last_failure = self.last_failure.lock();
                // Re-check under the lock: a concurrent probe may have
                // already moved us out of open.
                if self.state() != CircuitState::Open {
                    return Ok(());
                }
                let elapsed = last_failure.map(|at| at.elapsed());
                if elapsed.is_some_and(|e| e > self.reset_timeout) {
                    self.transition(CircuitState::Open, CircuitState::HalfOpen);
                    self.failure_count.store(0, Ordering::Relaxed);
                    return Ok(());
                }
                crate::metrics::record_gate_rejection("circuit_open");
                Err(crate::error::GatewayError::CircuitOpen)
            }
            CircuitState::HalfOpen | CircuitState::Closed => Ok(()),
        }
    }

    /// Record a successful protected operation.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                let _last_failure = self.last_failure.lock();
                if self.state() == CircuitState::HalfOpen {
                    self.transition(CircuitState::HalfOpen, CircuitState::Closed);
                    self.failure_count.store(0, Ordering::Relaxed);
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed protected operation.
    pub fn record_failure(&self) {
        let mut last_failure = self.last_failure.lock();
        *last_failure = Some(Instant::now());

        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        match self.state() {
            CircuitState::HalfOpen => {
                self.transition(CircuitState::HalfOpen, CircuitState::Open);
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Closed if failures >= self.max_failures => {
                self.transition(CircuitState::Closed, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) {
        self.state.store(to as u8, Ordering::Release);
        match to {
            CircuitState::Open => {
                warn!(from = %from, to = %to, "Circuit breaker opened");
            }
            _ => {
                debug!(from = %from, to = %to, "Circuit breaker state change");
            }
        }
        crate::metrics::set_circuit_state(to as u8);
        crate::metrics::record_circuit_transition(&from.to_string(), &to.to_string());
        if let Some(hook) = &self.on_state_change {
            hook(from, to);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .field("max_failures", &self.max_failures)
            .field("reset_timeout", &self.reset_timeout)
            .finish()
    }
}
