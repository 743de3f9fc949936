// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Token-bucket rate limiter.
//!
//! The bucket holds ten seconds of burst (`capacity = rate * 10`) and starts
//! full. Refill is computed lazily on each `allow()` from elapsed wall time,
//! so an idle limiter costs nothing. The whole path is a few arithmetic ops
//! under one mutex.

use std::time::Instant;

use parking_lot::Mutex;

use crate::error::GatewayError;

struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// Token-bucket limiter: `refill_rate` tokens per second, burst of
/// `max_tokens`.
pub struct RateLimiter {
    inner: Mutex<BucketState>,
    max_tokens: u64,
    refill_rate: u64,
}

impl RateLimiter {
    /// Create a limiter admitting `max_requests_per_second` sustained, with
    /// a ten-second burst. Zero falls back to 100 rps.
    pub fn new(max_requests_per_second: u64) -> Self {
        let (max_tokens, refill_rate) = if max_requests_per_second > 0 {
            (max_requests_per_second * 10, max_requests_per_second)
        } else {
            (1000, 100)
        };
        Self {
            inner: Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
            max_tokens,
            refill_rate,
        }
    }

    /// Take one token, refilling from elapsed time first.
    pub fn allow(&self) -> Result<(), GatewayError> {
        let mut bucket = self.inner.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        let to_add = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;
        if to_add > 0 {
            bucket.tokens = (bucket.tokens + to_add).min(self.max_tokens);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1 {
            bucket.tokens -= 1;
            Ok(())
        } else {
            crate::metrics::record_gate_rejection("rate_limit");
            Err(GatewayError::RateLimitExceeded)
        }
    }

    /// Current token count (monitoring only).
    #[must_use]
    pub fn tokens(&self) -> u64 {
        self.inner.lock().tokens
    }

    /// Configured burst capacity.
    #[must_use]
    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_tokens", &self.max_tokens)
            .field("refill_rate", &self.refill_rate)
            .field("tokens", &self.tokens())
            .finish()
    }
}
