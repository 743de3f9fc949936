//! Core value and result types shared by the facade and the wire protocol.
//!
//! The gateway treats SQL cell and argument values as opaque tagged scalars
//! ([`SqlValue`]); the driver performs dialect-side coercion. Result shapes
//! mirror their JSON wire encoding exactly, so the same structs serve both
//! the in-process facade API and the TCP protocol layer.

use serde::{Deserialize, Serialize};

/// An opaque SQL scalar: argument or result cell.
///
/// Deserialized from plain JSON scalars (variant order matters for the
/// untagged representation: integers must win over floats).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Normalise byte sequences to text for wire emission.
    ///
    /// Drivers commonly return TEXT columns as raw bytes; the protocol emits
    /// them as strings, matching what a JSON consumer expects.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Bytes(b) => match String::from_utf8(b) {
                Ok(s) => Self::Text(s),
                Err(e) => Self::Text(String::from_utf8_lossy(e.as_bytes()).into_owned()),
            },
            other => other,
        }
    }

    /// True for `SqlValue::Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Result of an `EXEC` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecResult {
    pub rows_affected: i64,
    pub last_insert_id: i64,
}

/// Result of a `QUERY` operation: materialised rows.
///
/// Every row tuple has the same arity as `columns`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

/// Connection pool statistics snapshot.
///
/// Field names are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsResult {
    pub max_open_connections: u32,
    pub open_connections: u32,
    pub in_use: u32,
    pub idle: u32,
    pub wait_count: u64,
    pub wait_duration_ns: u64,
    pub max_idle_closed: u64,
    pub max_idle_time_closed: u64,
    pub max_lifetime_closed: u64,
}

/// Query performance counters snapshot.
///
/// Field names are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsResult {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub slow_queries: u64,
    pub average_query_time_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_json_scalars() {
        let v: SqlValue = serde_json::from_str("42").unwrap();
        assert_eq!(v, SqlValue::Int(42));

        let v: SqlValue = serde_json::from_str("4.5").unwrap();
        assert_eq!(v, SqlValue::Float(4.5));

        let v: SqlValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, SqlValue::Bool(true));

        let v: SqlValue = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(v, SqlValue::Text("hello".into()));

        let v: SqlValue = serde_json::from_str("null").unwrap();
        assert_eq!(v, SqlValue::Null);
    }

    #[test]
    fn test_integer_wins_over_float() {
        // 7 must decode as Int, not Float(7.0)
        let v: SqlValue = serde_json::from_str("7").unwrap();
        assert!(matches!(v, SqlValue::Int(7)));
    }

    #[test]
    fn test_bytes_normalise_to_text() {
        let v = SqlValue::Bytes(b"abc".to_vec());
        assert_eq!(v.normalized(), SqlValue::Text("abc".into()));

        // Invalid UTF-8 is replaced, never dropped
        let v = SqlValue::Bytes(vec![0x66, 0xff, 0x6f]);
        match v.normalized() {
            SqlValue::Text(s) => assert!(s.contains('\u{fffd}')),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_exec_result_wire_names() {
        let json = serde_json::to_value(ExecResult {
            rows_affected: 3,
            last_insert_id: 9,
        })
        .unwrap();
        assert_eq!(json["rows_affected"], 3);
        assert_eq!(json["last_insert_id"], 9);
    }

    #[test]
    fn test_stats_result_wire_names() {
        let json = serde_json::to_value(StatsResult::default()).unwrap();
        for key in [
            "max_open_connections",
            "open_connections",
            "in_use",
            "idle",
            "wait_count",
            "wait_duration_ns",
            "max_idle_closed",
            "max_idle_time_closed",
            "max_lifetime_closed",
        ] {
            assert!(json.get(key).is_some(), "missing key {}", key);
        }
    }

    #[test]
    fn test_metrics_result_wire_names() {
        let json = serde_json::to_value(MetricsResult::default()).unwrap();
        for key in [
            "total_queries",
            "successful_queries",
            "failed_queries",
            "slow_queries",
            "average_query_time_ns",
        ] {
            assert!(json.get(key).is_some(), "missing key {}", key);
        }
    }

    #[test]
    fn test_query_result_roundtrip() {
        let result = QueryResult {
            columns: vec!["id".into(), "name".into()],
            rows: vec![
                vec![SqlValue::Int(1), SqlValue::Text("alice".into())],
                vec![SqlValue::Int(2), SqlValue::Null],
            ],
        };
        let encoded = serde_json::to_string(&result).unwrap();
        let decoded: QueryResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, result);
    }
}
