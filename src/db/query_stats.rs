//! Lock-free query performance counters.
//!
//! Counters are updated with relaxed atomics; a snapshot reads each counter
//! atomically but makes no cross-counter consistency promise, which is fine
//! for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::MetricsResult;

/// Atomic counters for query outcomes.
#[derive(Debug)]
pub struct QueryStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    slow: AtomicU64,
    total_duration_ns: AtomicU64,
    slow_threshold: Duration,
}

/// Point-in-time view of [`QueryStats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub slow: u64,
    pub avg_duration: Duration,
    pub success_rate: f64,
}

impl StatsSnapshot {
    /// Wire-shaped metrics payload.
    #[must_use]
    pub fn to_wire(&self) -> MetricsResult {
        MetricsResult {
            total_queries: self.total,
            successful_queries: self.succeeded,
            failed_queries: self.failed,
            slow_queries: self.slow,
            average_query_time_ns: self.avg_duration.as_nanos() as u64,
        }
    }
}

impl QueryStats {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            slow: AtomicU64::new(0),
            total_duration_ns: AtomicU64::new(0),
            slow_threshold,
        }
    }

    /// Record one completed query. Never fails.
    pub fn record(&self, duration: Duration, failed: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);

        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        }

        if duration > self.slow_threshold {
            self.slow.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_slow_query();
        }
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let slow = self.slow.load(Ordering::Relaxed);
        let total_ns = self.total_duration_ns.load(Ordering::Relaxed);

        let divisor = total.max(1);
        StatsSnapshot {
            total,
            succeeded,
            failed,
            slow,
            avg_duration: Duration::from_nanos(total_ns / divisor),
            success_rate: succeeded as f64 / divisor as f64 * 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_success_and_failure() {
        let stats = QueryStats::new(Duration::from_secs(1));
        stats.record(Duration::from_millis(10), false);
        stats.record(Duration::from_millis(20), true);
        stats.record(Duration::from_millis(30), false);

        let snap = stats.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.slow, 0);
        assert_eq!(snap.avg_duration, Duration::from_millis(20));
    }

    #[test]
    fn test_slow_query_counted() {
        let stats = QueryStats::new(Duration::from_millis(5));
        stats.record(Duration::from_millis(4), false);
        stats.record(Duration::from_millis(6), false);
        assert_eq!(stats.snapshot().slow, 1);
    }

    #[test]
    fn test_exactly_threshold_is_not_slow() {
        let stats = QueryStats::new(Duration::from_millis(5));
        stats.record(Duration::from_millis(5), false);
        assert_eq!(stats.snapshot().slow, 0);
    }

    #[test]
    fn test_empty_snapshot_divides_safely() {
        let stats = QueryStats::new(Duration::from_secs(1));
        let snap = stats.snapshot();
        assert_eq!(snap.total, 0);
        assert_eq!(snap.avg_duration, Duration::ZERO);
        assert_eq!(snap.success_rate, 0.0);
    }

    #[test]
    fn test_success_rate() {
        let stats = QueryStats::new(Duration::from_secs(1));
        for _ in 0..3 {
            stats.record(Duration::from_millis(1), false);
        }
        stats.record(Duration::from_millis(1), true);
        assert!((stats.snapshot().success_rate - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_wire_shape() {
        let stats = QueryStats::new(Duration::from_secs(1));
        stats.record(Duration::from_millis(2), false);
        let wire = stats.snapshot().to_wire();
        assert_eq!(wire.total_queries, 1);
        assert_eq!(wire.successful_queries, 1);
        assert_eq!(wire.average_query_time_ns, 2_000_000);
    }

    #[test]
    fn test_concurrent_recording() {
        let stats = std::sync::Arc::new(QueryStats::new(Duration::from_secs(1)));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let stats = stats.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    stats.record(Duration::from_nanos(100), false);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().total, 4000);
    }
}
