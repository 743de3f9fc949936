//! Resilience layer: circuit breaker, rate limiting, bounded concurrency,
//! and retry with exponential backoff.

pub mod circuit_breaker;
pub mod concurrency;
pub mod gate;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use concurrency::{BackpressureMode, ConcurrencyLimiter, SlotPermit};
pub use gate::{ConnectionGate, GateConfig, GatePermit};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
