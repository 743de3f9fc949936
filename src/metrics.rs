//! Metrics instrumentation for the gateway.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `sqlgate_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: exec, query, query_row, begin, validate
//! - `status`: success, error
//! - `kind`: circuit_open, rate_limit, connection_limit (gate rejections)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed database operation.
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "sqlgate_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency.
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "sqlgate_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a gate admission rejection.
pub fn record_gate_rejection(kind: &str) {
    counter!(
        "sqlgate_gate_rejections_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record circuit breaker state (0 = closed, 1 = half-open, 2 = open).
pub fn set_circuit_state(state: u8) {
    gauge!("sqlgate_circuit_breaker_state").set(state as f64);
}

/// Record a circuit breaker state transition.
pub fn record_circuit_transition(from: &str, to: &str) {
    counter!(
        "sqlgate_circuit_breaker_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Set in-flight operation count.
pub fn set_in_flight(count: u64) {
    gauge!("sqlgate_in_flight").set(count as f64);
}

/// Record a cache operation (result or idempotency cache).
pub fn record_cache_op(cache: &str, outcome: &str) {
    counter!(
        "sqlgate_cache_ops_total",
        "cache" => cache.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a connection leak event.
pub fn record_leak() {
    counter!("sqlgate_connection_leaks_total").increment(1);
}

/// Record a connection discarded after failed validation.
pub fn record_validation_discard() {
    counter!("sqlgate_validation_discards_total").increment(1);
}

/// Record a slow query.
pub fn record_slow_query() {
    counter!("sqlgate_slow_queries_total").increment(1);
}

/// Set the number of currently tracked (issued) connections.
pub fn set_tracked_connections(count: u64) {
    gauge!("sqlgate_tracked_connections").set(count as f64);
}

/// Record a TCP request by kind and outcome.
pub fn record_request(kind: &str, status: &str) {
    counter!(
        "sqlgate_requests_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a rejected connection or request at the admission layer.
pub fn record_admission_rejection(reason: &str) {
    counter!(
        "sqlgate_admission_rejections_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set currently connected TCP client count.
pub fn set_connected_clients(count: u64) {
    gauge!("sqlgate_connected_clients").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These verify the API compiles and doesn't panic; with no recorder
    // installed the macros are no-ops.

    #[test]
    fn test_counters() {
        record_operation("exec", "success");
        record_operation("query", "error");
        record_gate_rejection("rate_limit");
        record_circuit_transition("closed", "open");
        record_cache_op("result", "hit");
        record_cache_op("idempotency", "miss");
        record_leak();
        record_validation_discard();
        record_slow_query();
        record_request("PING", "success");
        record_admission_rejection("blacklist");
    }

    #[test]
    fn test_gauges_and_histograms() {
        set_circuit_state(0);
        set_in_flight(3);
        set_tracked_connections(2);
        set_connected_clients(10);
        record_latency("exec", Duration::from_millis(5));
    }
}
