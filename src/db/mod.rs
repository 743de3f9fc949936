//! Managed database facade.
//!
//! [`DbRuntime`] fronts the driver pool with the full treatment: every call
//! passes the resilience gate, runs on a validated tracked connection, is
//! retried on transient failures within a per-call deadline, and lands in
//! the query counters. Transactions hold their gate slot until commit or
//! rollback settles it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::any::{AnyArguments, AnyRow, AnyStatement};
use sqlx::{Any, Column, Executor, Row, Statement};
use tokio::sync::watch;
use tracing::info;

use crate::cache::{CacheStats, InMemoryCache};
use crate::config::RuntimeConfig;
use crate::error::GatewayError;
use crate::resilience::circuit_breaker::CircuitState;
use crate::resilience::gate::{ConnectionGate, GateConfig, GatePermit};
use crate::resilience::retry::RetryPolicy;
use crate::types::{ExecResult, MetricsResult, QueryResult, SqlValue, StatsResult};

pub mod manager;
pub mod query_stats;
pub mod statement_cache;

pub use manager::{ConnectionManager, LeakCallback, TrackedConnection};
pub use query_stats::{QueryStats, StatsSnapshot};
pub use statement_cache::StatementCache;

/// Dispatch surface the TCP server consumes.
///
/// Kept narrow so tests can substitute a counting or failing backend.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn exec(&self, sql: &str, args: &[SqlValue]) -> Result<ExecResult, GatewayError>;
    async fn query(&self, sql: &str, args: &[SqlValue]) -> Result<QueryResult, GatewayError>;
    fn stats(&self) -> Result<StatsResult, GatewayError>;
    fn metrics(&self) -> Result<MetricsResult, GatewayError>;
}

struct RuntimeInner {
    manager: Arc<ConnectionManager>,
    gate: ConnectionGate,
    stats: Arc<QueryStats>,
    stmt_cache: StatementCache,
    retry: RetryPolicy,
    result_cache: Option<InMemoryCache<QueryResult>>,
    query_timeout: Duration,
    shutdown: watch::Sender<bool>,
    leak_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// The gateway's database runtime.
///
/// Construct with [`DbRuntime::new`], then [`connect`](DbRuntime::connect).
/// All state is scoped to the instance; teardown is explicit via
/// [`disconnect`](DbRuntime::disconnect).
pub struct DbRuntime {
    config: RuntimeConfig,
    inner: RwLock<Option<Arc<RuntimeInner>>>,
    lifecycle: tokio::sync::Mutex<()>,
    leak_callback: parking_lot::Mutex<Option<LeakCallback>>,
}

impl DbRuntime {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            leak_callback: parking_lot::Mutex::new(None),
        }
    }

    /// Register a leak callback. Takes effect at the next `connect()`.
    pub fn set_leak_callback(&self, callback: LeakCallback) {
        *self.leak_callback.lock() = Some(callback);
    }

    /// Open the pool, ping it, pre-warm connections, and start background
    /// tasks. Idempotent: a second call on a connected runtime is a no-op.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.inner.read().is_some() {
            return Ok(());
        }

        let manager = Arc::new(ConnectionManager::open(&self.config).await?);

        if self.config.warmup_connections > 0 {
            manager
                .warmup(
                    self.config.warmup_connections.min(self.config.max_idle_conns),
                    self.config.warmup_timeout,
                )
                .await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let leak_task = if self.config.enable_leak_detection {
            let scan_manager = manager.clone();
            let threshold = self.config.leak_detection_threshold;
            Some(manager::spawn_leak_detector(
                Arc::new(move || scan_manager.collect_leaks(threshold)),
                self.config.leak_check_interval,
                shutdown_rx,
                self.leak_callback.lock().clone(),
            ))
        } else {
            None
        };

        let result_cache = self.config.enable_aggressive_caching.then(|| {
            InMemoryCache::new(
                "result",
                self.config.cache_capacity,
                self.config.cache_default_ttl,
            )
        });

        let inner = RuntimeInner {
            manager,
            gate: ConnectionGate::new(GateConfig::from(&self.config)),
            stats: Arc::new(QueryStats::new(self.config.slow_query_threshold)),
            stmt_cache: StatementCache::new(self.config.stmt_cache_size),
            retry: RetryPolicy::new(self.config.max_retries, self.config.retry_backoff),
            result_cache,
            query_timeout: self.config.query_timeout,
            shutdown: shutdown_tx,
            leak_task: parking_lot::Mutex::new(leak_task),
        };

        *self.inner.write() = Some(Arc::new(inner));
        info!(dialect = %self.config.dialect, "Database runtime connected");
        Ok(())
    }

    /// Stop background tasks, release cached statement handles, and close
    /// the pool. Idempotent.
    pub async fn disconnect(&self) -> Result<(), GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let inner = match self.inner.write().take() {
            Some(inner) => inner,
            None => return Ok(()),
        };

        let _ = inner.shutdown.send(true);
        let leak_task = inner.leak_task.lock().take();
        if let Some(task) = leak_task {
            let _ = task.await;
        }

        inner.stmt_cache.clear();
        inner.manager.close().await;
        info!("Database runtime disconnected");
        Ok(())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.read().is_some()
    }

    fn runtime(&self) -> Result<Arc<RuntimeInner>, GatewayError> {
        self.inner
            .read()
            .as_ref()
            .cloned()
            .ok_or(GatewayError::NotConnected)
    }

    /// Execute a statement that returns no rows.
    pub async fn exec(&self, sql: &str, args: &[SqlValue]) -> Result<ExecResult, GatewayError> {
        let inner = self.runtime()?;
        let start = Instant::now();
        let result = Self::exec_gated(&inner, sql, args).await;
        Self::finish(&inner, "exec", start, result.is_err());
        result
    }

    /// Execute a statement and materialise every row.
    pub async fn query(&self, sql: &str, args: &[SqlValue]) -> Result<QueryResult, GatewayError> {
        let inner = self.runtime()?;
        let start = Instant::now();
        let result = Self::query_gated(&inner, sql, args).await;
        Self::finish(&inner, "query", start, result.is_err());
        result
    }

    /// Execute a statement expecting at most one row; `Ok(None)` is the
    /// no-rows outcome.
    ///
    /// Not wrapped in the gate: the single-row path surfaces driver errors
    /// only at scan time, so there is no admission-to-release window to
    /// protect.
    pub async fn query_row(
        &self,
        sql: &str,
        args: &[SqlValue],
    ) -> Result<Option<Vec<SqlValue>>, GatewayError> {
        let inner = self.runtime()?;
        let start = Instant::now();

        let result = async {
            let mut tracked = inner.manager.acquire().await?;
            let query = bind_args(sqlx::query(sql), args);
            let row = match tokio::time::timeout(
                inner.query_timeout,
                query.fetch_optional(&mut *tracked.conn()),
            )
            .await
            {
                Ok(fetched) => fetched.map_err(GatewayError::from_driver)?,
                Err(_) => return Err(GatewayError::Timeout(inner.query_timeout)),
            };
            tracked.record_query();
            Ok(row.map(|row| {
                (0..row.columns().len())
                    .map(|idx| decode_cell(&row, idx))
                    .collect()
            }))
        }
        .await;

        Self::finish(&inner, "query_row", start, result.is_err());
        result
    }

    /// Result-caching query path.
    ///
    /// On a cache hit returns `(result, true)` without touching the
    /// database; on a miss runs the query, stores it under `key` with
    /// `ttl`, and returns `(result, false)`.
    pub async fn query_cached(
        &self,
        key: &str,
        ttl: Duration,
        sql: &str,
        args: &[SqlValue],
    ) -> Result<(QueryResult, bool), GatewayError> {
        let inner = self.runtime()?;
        if let Some(cache) = &inner.result_cache {
            if let Some(hit) = cache.get(key) {
                return Ok((hit, true));
            }
        }

        let result = self.query(sql, args).await?;
        if let Some(cache) = &inner.result_cache {
            cache.set(key, result.clone(), ttl);
        }
        Ok((result, false))
    }

    /// Fetch (or create and cache) a prepared statement for `sql`.
    pub async fn prepare(&self, sql: &str) -> Result<AnyStatement<'static>, GatewayError> {
        let inner = self.runtime()?;
        if let Some(statement) = inner.stmt_cache.get(sql) {
            return Ok(statement);
        }
        let mut tracked = inner.manager.acquire().await?;
        let prepared = tracked
            .conn()
            .prepare(sql)
            .await
            .map_err(GatewayError::from_driver)?;
        tracked.record_query();
        let owned = prepared.to_owned();
        inner.stmt_cache.put(sql, Statement::to_owned(&owned));
        Ok(owned)
    }

    /// Begin a transaction. The returned handle owns a gate slot until
    /// commit or rollback.
    pub async fn begin(&self) -> Result<GatewayTransaction, GatewayError> {
        let inner = self.runtime()?;
        let permit = inner.gate.acquire().await?;

        let tx = match tokio::time::timeout(inner.query_timeout, inner.manager.pool().begin()).await
        {
            Ok(Ok(tx)) => tx,
            Ok(Err(err)) => {
                permit.failure();
                return Err(GatewayError::from_driver(err));
            }
            Err(_) => {
                permit.failure();
                return Err(GatewayError::Timeout(inner.query_timeout));
            }
        };

        Ok(GatewayTransaction {
            tx: Some(tx),
            permit: Some(permit),
            stats: inner.stats.clone(),
        })
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        F: for<'t> FnOnce(
            &'t mut GatewayTransaction,
        ) -> futures::future::BoxFuture<'t, Result<T, GatewayError>>,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Connection pool statistics.
    pub fn stats(&self) -> Result<StatsResult, GatewayError> {
        Ok(self.runtime()?.manager.pool_stats())
    }

    /// Query counters in wire shape.
    pub fn metrics(&self) -> Result<MetricsResult, GatewayError> {
        Ok(self.runtime()?.stats.snapshot().to_wire())
    }

    /// Query counters with derived averages.
    pub fn metrics_snapshot(&self) -> Result<StatsSnapshot, GatewayError> {
        Ok(self.runtime()?.stats.snapshot())
    }

    /// Circuit breaker state.
    pub fn circuit_state(&self) -> Result<CircuitState, GatewayError> {
        Ok(self.runtime()?.gate.state())
    }

    /// Operations currently admitted by the gate.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.inner
            .read()
            .as_ref()
            .map_or(0, |inner| inner.gate.in_flight())
    }

    /// Result cache statistics, when aggressive caching is enabled.
    #[must_use]
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.inner
            .read()
            .as_ref()
            .and_then(|inner| inner.result_cache.as_ref().map(InMemoryCache::stats))
    }

    /// Drop expired result-cache entries.
    pub fn purge_expired_cache(&self) {
        if let Some(inner) = self.inner.read().as_ref() {
            if let Some(cache) = &inner.result_cache {
                cache.purge_expired();
            }
        }
    }

    /// Ping the database within a five second budget.
    pub async fn health_check(&self) -> Result<(), GatewayError> {
        let inner = self.runtime()?;
        inner.manager.ping(Duration::from_secs(5)).await
    }

    async fn exec_gated(
        inner: &Arc<RuntimeInner>,
        sql: &str,
        args: &[SqlValue],
    ) -> Result<ExecResult, GatewayError> {
        let deadline = inner.query_timeout;
        match tokio::time::timeout(
            deadline,
            inner
                .retry
                .run("exec", |_| inner.gate.execute(|| Self::run_exec(inner, sql, args))),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(deadline)),
        }
    }

    async fn query_gated(
        inner: &Arc<RuntimeInner>,
        sql: &str,
        args: &[SqlValue],
    ) -> Result<QueryResult, GatewayError> {
        let deadline = inner.query_timeout;
        match tokio::time::timeout(
            deadline,
            inner
                .retry
                .run("query", |_| inner.gate.execute(|| Self::run_query(inner, sql, args))),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(deadline)),
        }
    }

    async fn run_exec(
        inner: &RuntimeInner,
        sql: &str,
        args: &[SqlValue],
    ) -> Result<ExecResult, GatewayError> {
        let mut tracked = inner.manager.acquire().await?;
        let done = bind_args(sqlx::query(sql), args)
            .execute(&mut *tracked.conn())
            .await
            .map_err(GatewayError::from_driver)?;
        tracked.record_query();
        Ok(ExecResult {
            rows_affected: done.rows_affected() as i64,
            last_insert_id: done.last_insert_id().unwrap_or(0),
        })
    }

    async fn run_query(
        inner: &RuntimeInner,
        sql: &str,
        args: &[SqlValue],
    ) -> Result<QueryResult, GatewayError> {
        let mut tracked = inner.manager.acquire().await?;

        let statement = match inner.stmt_cache.get(sql) {
            Some(statement) => statement,
            None => {
                let prepared = tracked
                    .conn()
                    .prepare(sql)
                    .await
                    .map_err(GatewayError::from_driver)?;
                let owned = prepared.to_owned();
                inner.stmt_cache.put(sql, Statement::to_owned(&owned));
                owned
            }
        };

        let mut columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();

        let rows = bind_args(statement.query(), args)
            .fetch_all(&mut *tracked.conn())
            .await
            .map_err(GatewayError::from_driver)?;
        tracked.record_query();

        if columns.is_empty() {
            if let Some(row) = rows.first() {
                columns = row
                    .columns()
                    .iter()
                    .map(|column| column.name().to_string())
                    .collect();
            }
        }

        let materialised = rows
            .iter()
            .map(|row| (0..columns.len()).map(|idx| decode_cell(row, idx)).collect())
            .collect();

        Ok(QueryResult {
            columns,
            rows: materialised,
        })
    }

    fn finish(inner: &RuntimeInner, operation: &str, start: Instant, failed: bool) {
        let elapsed = start.elapsed();
        inner.stats.record(elapsed, failed);
        crate::metrics::record_operation(operation, if failed { "error" } else { "success" });
        crate::metrics::record_latency(operation, elapsed);
    }
}

impl std::fmt::Debug for DbRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbRuntime")
            .field("connected", &self.is_connected())
            .field("dialect", &self.config.dialect)
            .finish()
    }
}

#[async_trait]
impl QueryBackend for DbRuntime {
    async fn exec(&self, sql: &str, args: &[SqlValue]) -> Result<ExecResult, GatewayError> {
        DbRuntime::exec(self, sql, args).await
    }

    async fn query(&self, sql: &str, args: &[SqlValue]) -> Result<QueryResult, GatewayError> {
        DbRuntime::query(self, sql, args).await
    }

    fn stats(&self) -> Result<StatsResult, GatewayError> {
        DbRuntime::stats(self)
    }

    fn metrics(&self) -> Result<MetricsResult, GatewayError> {
        DbRuntime::metrics(self)
    }
}

/// A transaction holding one gate slot.
///
/// Exactly one of [`commit`](GatewayTransaction::commit) /
/// [`rollback`](GatewayTransaction::rollback) should be called. Dropping
/// the handle unresolved rolls the transaction back and records a gate
/// failure.
pub struct GatewayTransaction {
    tx: Option<sqlx::Transaction<'static, Any>>,
    permit: Option<GatePermit>,
    stats: Arc<QueryStats>,
}

impl GatewayTransaction {
    /// Execute a statement inside the transaction.
    pub async fn exec(&mut self, sql: &str, args: &[SqlValue]) -> Result<ExecResult, GatewayError> {
        let start = Instant::now();
        let result = match self.tx.as_mut() {
            Some(tx) => bind_args(sqlx::query(sql), args)
                .execute(&mut **tx)
                .await
                .map_err(GatewayError::from_driver)
                .map(|done| ExecResult {
                    rows_affected: done.rows_affected() as i64,
                    last_insert_id: done.last_insert_id().unwrap_or(0),
                }),
            None => Err(completed()),
        };
        self.stats.record(start.elapsed(), result.is_err());
        result
    }

    /// Execute a query inside the transaction and materialise the rows.
    pub async fn query(&mut self, sql: &str, args: &[SqlValue]) -> Result<QueryResult, GatewayError> {
        let start = Instant::now();
        let result = match self.tx.as_mut() {
            Some(tx) => {
                let rows = bind_args(sqlx::query(sql), args)
                    .fetch_all(&mut **tx)
                    .await
                    .map_err(GatewayError::from_driver)?;
                let columns: Vec<String> = rows
                    .first()
                    .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
                    .unwrap_or_default();
                let materialised = rows
                    .iter()
                    .map(|row| (0..columns.len()).map(|idx| decode_cell(row, idx)).collect())
                    .collect();
                Ok(QueryResult {
                    columns,
                    rows: materialised,
                })
            }
            None => Err(completed()),
        };
        self.stats.record(start.elapsed(), result.is_err());
        result
    }

    /// Commit: records gate success on success, failure otherwise.
    pub async fn commit(mut self) -> Result<(), GatewayError> {
        let tx = self.tx.take().ok_or_else(completed)?;
        let outcome = tx.commit().await;
        match (outcome, self.permit.take()) {
            (Ok(()), Some(permit)) => {
                permit.success();
                Ok(())
            }
            (Ok(()), None) => Ok(()),
            (Err(err), permit) => {
                if let Some(permit) = permit {
                    permit.failure();
                }
                Err(GatewayError::TransactionFailed {
                    message: "commit failed".into(),
                    source: Some(err),
                })
            }
        }
    }

    /// Roll back: records a gate failure.
    pub async fn rollback(mut self) -> Result<(), GatewayError> {
        let tx = self.tx.take().ok_or_else(completed)?;
        let outcome = tx.rollback().await;
        if let Some(permit) = self.permit.take() {
            permit.failure();
        }
        outcome.map_err(|err| GatewayError::TransactionFailed {
            message: "rollback failed".into(),
            source: Some(err),
        })
    }
}

fn completed() -> GatewayError {
    GatewayError::TransactionFailed {
        message: "transaction already completed".into(),
        source: None,
    }
}

/// Bind opaque scalars onto a plain query; the driver coerces dialect-side.
fn bind_args<'q>(
    mut query: sqlx::query::Query<'q, Any, AnyArguments<'q>>,
    args: &[SqlValue],
) -> sqlx::query::Query<'q, Any, AnyArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Bytes(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Decode one cell into an opaque scalar, normalising byte cells to text.
///
/// NULL decodes first (any typed `Option` reads `None`); otherwise the
/// chain tries integer, float, bool, text, then blob.
fn decode_cell(row: &AnyRow, idx: usize) -> SqlValue {
    if let Ok(value) = row.try_get::<Option<i64>, _>(idx) {
        return match value {
            Some(v) => SqlValue::Int(v),
            None => SqlValue::Null,
        };
    }
    if let Ok(value) = row.try_get::<f64, _>(idx) {
        return SqlValue::Float(value);
    }
    if let Ok(value) = row.try_get::<bool, _>(idx) {
        return SqlValue::Bool(value);
    }
    if let Ok(value) = row.try_get::<String, _>(idx) {
        return SqlValue::Text(value);
    }
    if let Ok(value) = row.try_get::<Vec<u8>, _>(idx) {
        return SqlValue::Bytes(value).normalized();
    }
    SqlValue::Null
}
