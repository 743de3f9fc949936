// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Managed connection layer over the driver pool.
//!
//! Responsibilities: open and configure the pool, validate connections
//! before use (with a small retry budget and replacement of bad
//! connections), pre-warm the pool, track issued connections, and feed the
//! leak detector.
//!
//! Pool knob mapping onto the driver: `max_open` → max connections,
//! `max_idle` → min (kept-warm) connections, `conn_max_lifetime` → max
//! lifetime, `conn_max_idle_time` → idle timeout, `connection_timeout` →
//! acquire timeout. The driver reclaims idle and expired connections
//! internally without itemised counters, so the three `*_closed` stats
//! fields stay zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sqlx::any::AnyPoolOptions;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool, Connection};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::GatewayError;
use crate::types::StatsResult;

// The `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const VALIDATION_ATTEMPTS: u32 = 3;
const VALIDATION_BACKOFF: Duration = Duration::from_millis(100);

/// Callback invoked with `(connection_id, age)` for each detected leak.
pub type LeakCallback = Arc<dyn Fn(u64, Duration) + Send + Sync>;

/// Book-keeping for one issued connection.
#[derive(Debug, Clone, Copy)]
pub struct TrackedInfo {
    pub acquired_at: Instant,
    pub last_used_at: Instant,
    pub query_count: u64,
    leak_reported: bool,
}

/// A pool connection under leak tracking. Dropping it releases the
/// connection to the pool and removes it from the tracked set.
pub struct TrackedConnection {
    conn: PoolConnection<Any>,
    id: u64,
    tracked: Arc<DashMap<u64, TrackedInfo>>,
}

impl TrackedConnection {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying driver connection.
    pub fn conn(&mut self) -> &mut sqlx::AnyConnection {
        &mut self.conn
    }

    /// Bump usage accounting after running a statement.
    pub fn record_query(&self) {
        if let Some(mut info) = self.tracked.get_mut(&self.id) {
            info.last_used_at = Instant::now();
            info.query_count += 1;
        }
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.tracked.remove(&self.id);
        crate::metrics::set_tracked_connections(self.tracked.len() as u64);
    }
}

/// Opens the pool and hands out validated, tracked connections.
pub struct ConnectionManager {
    pool: AnyPool,
    max_open: u32,
    validation_query: String,
    validation_timeout: Duration,
    enable_validation: bool,
    connection_timeout: Duration,
    next_id: AtomicU64,
    tracked: Arc<DashMap<u64, TrackedInfo>>,
    wait_count: AtomicU64,
    wait_duration_ns: AtomicU64,
    validation_discards: AtomicU64,
}

impl ConnectionManager {
    /// Open and ping the pool.
    pub async fn open(config: &RuntimeConfig) -> Result<Self, GatewayError> {
        install_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns.min(config.max_open_conns))
            .max_lifetime(Some(config.conn_max_lifetime))
            .idle_timeout(Some(config.conn_max_idle_time))
            .acquire_timeout(config.connection_timeout)
            .connect(&config.dsn)
            .await
            .map_err(|err| GatewayError::ConnectionFailed {
                message: format!("failed to open {} pool", config.dialect),
                source: Some(err),
            })?;

        let manager = Self {
            pool,
            max_open: config.max_open_conns,
            validation_query: config.effective_validation_query().to_string(),
            validation_timeout: config.validation_timeout,
            enable_validation: config.enable_validation,
            connection_timeout: config.connection_timeout,
            next_id: AtomicU64::new(0),
            tracked: Arc::new(DashMap::new()),
            wait_count: AtomicU64::new(0),
            wait_duration_ns: AtomicU64::new(0),
            validation_discards: AtomicU64::new(0),
        };

        // Initial ping proves the DSN actually reaches a database
        manager.ping(config.connection_timeout).await?;
        info!(dialect = %config.dialect, max_open = config.max_open_conns, "Database pool opened");
        Ok(manager)
    }

    /// Run the validation statement against the pool within `timeout`.
    pub async fn ping(&self, timeout: Duration) -> Result<(), GatewayError> {
        match tokio::time::timeout(timeout, sqlx::query(&self.validation_query).execute(&self.pool))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(GatewayError::ConnectionFailed {
                message: "ping failed".into(),
                source: Some(err),
            }),
            Err(_) => Err(GatewayError::Timeout(timeout)),
        }
    }

    /// Pre-warm up to `count` connections by acquiring and holding them
    /// together, then releasing all back to the pool idle set.
    pub async fn warmup(&self, count: u32, budget: Duration) {
        if count == 0 {
            return;
        }
        let budget = if budget.is_zero() {
            Duration::from_secs(30)
        } else {
            budget
        };
        let deadline = Instant::now() + budget;

        let mut held = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.pool.acquire()).await {
                Ok(Ok(conn)) => held.push(conn),
                Ok(Err(err)) => {
                    debug!(error = %err, "Warm-up acquire failed");
                    break;
                }
                Err(_) => break,
            }
        }
        debug!(warmed = held.len(), requested = count, "Connection warm-up complete");
    }

    /// Acquire a connection, validating it first when enabled.
    ///
    /// A connection that fails validation after the retry budget is closed
    /// and replaced with a fresh one; the call fails once `connection_timeout`
    /// has elapsed without a validated connection.
    pub async fn acquire(&self) -> Result<TrackedConnection, GatewayError> {
        let started = Instant::now();
        loop {
            let contended = self.pool.num_idle() == 0 && self.pool.size() >= self.max_open;
            let wait_start = Instant::now();
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(GatewayError::from_driver)?;
            if contended {
                self.wait_count.fetch_add(1, Ordering::Relaxed);
                self.wait_duration_ns
                    .fetch_add(wait_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
            }

            if self.enable_validation {
                if let Err(err) = self.validate(&mut conn).await {
                    self.validation_discards.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_validation_discard();
                    warn!(error = %err, "Discarding connection that failed validation");

                    let raw = conn.detach();
                    let _ = raw.close().await;

                    if started.elapsed() > self.connection_timeout {
                        return Err(err);
                    }
                    continue;
                }
            }

            return Ok(self.track(conn));
        }
    }

    async fn validate(&self, conn: &mut PoolConnection<Any>) -> Result<(), GatewayError> {
        let mut last_err: Option<sqlx::Error> = None;
        for attempt in 1..=VALIDATION_ATTEMPTS {
            match tokio::time::timeout(
                self.validation_timeout,
                sqlx::query(&self.validation_query).execute(&mut **conn),
            )
            .await
            {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(err)) => last_err = Some(err),
                Err(_elapsed) => last_err = None,
            }
            if attempt < VALIDATION_ATTEMPTS {
                tokio::time::sleep(VALIDATION_BACKOFF * attempt).await;
            }
        }
        Err(GatewayError::ValidationFailed {
            attempts: VALIDATION_ATTEMPTS,
            source: last_err,
        })
    }

    fn track(&self, conn: PoolConnection<Any>) -> TrackedConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();
        self.tracked.insert(
            id,
            TrackedInfo {
                acquired_at: now,
                last_used_at: now,
                query_count: 0,
                leak_reported: false,
            },
        );
        crate::metrics::set_tracked_connections(self.tracked.len() as u64);
        TrackedConnection {
            conn,
            id,
            tracked: self.tracked.clone(),
        }
    }

    /// Collect connections held past `threshold`, marking each so it is
    /// reported exactly once.
    pub fn collect_leaks(&self, threshold: Duration) -> Vec<(u64, Duration)> {
        let now = Instant::now();
        let mut leaks = Vec::new();
        for mut entry in self.tracked.iter_mut() {
            let age = now.duration_since(entry.acquired_at);
            if age > threshold && !entry.leak_reported {
                entry.leak_reported = true;
                leaks.push((*entry.key(), age));
            }
        }
        leaks
    }

    /// Number of currently issued connections.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Current pool statistics.
    #[must_use]
    pub fn pool_stats(&self) -> StatsResult {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        StatsResult {
            max_open_connections: self.max_open,
            open_connections: size,
            in_use: size.saturating_sub(idle),
            idle,
            wait_count: self.wait_count.load(Ordering::Relaxed),
            wait_duration_ns: self.wait_duration_ns.load(Ordering::Relaxed),
            max_idle_closed: 0,
            max_idle_time_closed: 0,
            max_lifetime_closed: 0,
        }
    }

    /// Connections discarded after failed validation.
    #[must_use]
    pub fn validation_discards(&self) -> u64 {
        self.validation_discards.load(Ordering::Relaxed)
    }

    /// The underlying pool (for transactions).
    #[must_use]
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Close the pool and drop all tracking state.
    pub async fn close(&self) {
        self.pool.close().await;
        self.tracked.clear();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("max_open", &self.max_open)
            .field("tracked", &self.tracked.len())
            .finish()
    }
}

/// Spawn the periodic leak detector.
///
/// The detector only reports; it never closes connections. It holds a
/// snapshot closure rather than a manager reference, so the facade and the
/// detector stay decoupled.
pub fn spawn_leak_detector(
    scan: Arc<dyn Fn() -> Vec<(u64, Duration)> + Send + Sync>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    callback: Option<LeakCallback>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; skip that first tick
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (id, age) in scan() {
                        warn!(
                            connection_id = id,
                            age_ms = age.as_millis() as u64,
                            "Connection held past leak threshold"
                        );
                        crate::metrics::record_leak();
                        if let Some(cb) = &callback {
                            cb(id, age);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Leak detector stopping");
                    return;
                }
            }
        }
    })
}
