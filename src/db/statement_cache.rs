// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Prepared-statement cache keyed by verbatim SQL text.
//!
//! Capacity-bounded: when full, one arbitrary entry is evicted and its
//! handle dropped. The cache is process-local, never shared across
//! runtimes, and cleared on shutdown.

use std::collections::HashMap;

use parking_lot::Mutex;
use sqlx::any::AnyStatement;
use sqlx::Statement as _;

/// Bounded cache of prepared statement handles.
pub struct StatementCache {
    inner: Mutex<HashMap<String, AnyStatement<'static>>>,
    max_size: usize,
}

impl StatementCache {
    /// Zero `max_size` falls back to 100 entries.
    pub fn new(max_size: usize) -> Self {
        let max_size = if max_size == 0 { 100 } else { max_size };
        Self {
            inner: Mutex::new(HashMap::with_capacity(max_size.min(64))),
            max_size,
        }
    }

    /// Fetch a cached handle for this SQL text.
    pub fn get(&self, sql: &str) -> Option<AnyStatement<'static>> {
        self.inner.lock().get(sql).map(AnyStatement::to_owned)
    }

    /// Store a handle, evicting one arbitrary entry when full.
    pub fn put(&self, sql: &str, statement: AnyStatement<'static>) {
        let mut inner = self.inner.lock();
        if inner.len() >= self.max_size && !inner.contains_key(sql) {
            if let Some(victim) = inner.keys().next().cloned() {
                inner.remove(&victim);
            }
        }
        inner.insert(sql.to_string(), statement);
    }

    /// Release every cached handle.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Number of cached statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}
