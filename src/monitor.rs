// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Continuous monitoring of a [`DbRuntime`].
//!
//! A periodic task samples diagnostics and health, invokes registered
//! callbacks, and raises dedicated events when health degrades, slow
//! queries accumulate, or the circuit breaker opens.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db::DbRuntime;
use crate::error::GatewayError;
use crate::resilience::CircuitState;
use crate::types::{MetricsResult, StatsResult};

/// One diagnostics sample: pool, counters, breaker.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub pool: StatsResult,
    pub metrics: MetricsResult,
    pub circuit_state: CircuitState,
    pub success_rate: f64,
}

impl Diagnostics {
    /// Collect a sample from a connected runtime.
    pub fn collect(runtime: &DbRuntime) -> Result<Self, GatewayError> {
        let snapshot = runtime.metrics_snapshot()?;
        Ok(Self {
            pool: runtime.stats()?,
            metrics: snapshot.to_wire(),
            circuit_state: runtime.circuit_state()?,
            success_rate: snapshot.success_rate,
        })
    }

    /// Human-readable render for logs and consoles.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "Gateway Diagnostics\n\
             ===================\n\
             Circuit Breaker: {}\n\
             \n\
             Connection Pool:\n\
             \x20 Open Connections: {}\n\
             \x20 In Use: {}\n\
             \x20 Idle: {}\n\
             \x20 Wait Count: {}\n\
             \n\
             Performance Metrics:\n\
             \x20 Total Queries: {}\n\
             \x20 Successful: {}\n\
             \x20 Failed: {}\n\
             \x20 Success Rate: {:.2}%\n\
             \x20 Average Query Time: {}ns\n\
             \x20 Slow Queries: {}\n",
            self.circuit_state,
            self.pool.open_connections,
            self.pool.in_use,
            self.pool.idle,
            self.pool.wait_count,
            self.metrics.total_queries,
            self.metrics.successful_queries,
            self.metrics.failed_queries,
            self.success_rate,
            self.metrics.average_query_time_ns,
            self.metrics.slow_queries,
        )
    }
}

/// Health verdict combining connection, breaker, and pool saturation.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
    pub connection_ok: bool,
    pub circuit_ok: bool,
}

/// Run the full health check against a runtime.
pub async fn check_health(runtime: &DbRuntime) -> HealthStatus {
    if let Err(err) = runtime.health_check().await {
        return HealthStatus {
            healthy: false,
            message: format!("connection check failed: {}", err),
            connection_ok: false,
            circuit_ok: false,
        };
    }

    match runtime.circuit_state() {
        Ok(CircuitState::Open) => {
            return HealthStatus {
                healthy: false,
                message: "circuit breaker is open".to_string(),
                connection_ok: true,
                circuit_ok: false,
            };
        }
        Ok(_) => {}
        Err(err) => {
            return HealthStatus {
                healthy: false,
                message: err.to_string(),
                connection_ok: true,
                circuit_ok: false,
            };
        }
    }

    if let Ok(stats) = runtime.stats() {
        if stats.open_connections >= stats.max_open_connections {
            return HealthStatus {
                healthy: false,
                message: "connection pool is at capacity".to_string(),
                connection_ok: true,
                circuit_ok: true,
            };
        }
    }

    HealthStatus {
        healthy: true,
        message: "all systems operational".to_string(),
        connection_ok: true,
        circuit_ok: true,
    }
}

/// Events delivered to monitor callbacks.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    PeriodicCheck {
        diagnostics: Diagnostics,
        health: HealthStatus,
    },
    HealthWarning {
        message: String,
    },
    /// Slow queries have accumulated; fired on every check while the
    /// counter is non-zero.
    SlowQueries {
        total: u64,
    },
    CircuitOpen,
}

/// Callback invoked for every monitor event.
pub type MonitorCallback = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

/// Periodic runtime monitor.
pub struct Monitor {
    runtime: Arc<DbRuntime>,
    interval: Duration,
    callbacks: Arc<Mutex<Vec<MonitorCallback>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(runtime: Arc<DbRuntime>, interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            runtime,
            interval,
            callbacks: Arc::new(Mutex::new(Vec::new())),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Register a callback. Effective immediately, including on a running
    /// monitor.
    pub fn add_callback(&self, callback: MonitorCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Start the monitoring loop. A second start is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let runtime = self.runtime.clone();
        let callbacks = self.callbacks.clone();
        let interval = self.interval;
        let mut shutdown = self.shutdown.subscribe();

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::check(&runtime, &callbacks).await;
                    }
                    _ = shutdown.changed() => {
                        debug!("Monitor stopping");
                        return;
                    }
                }
            }
        }));
    }

    /// Stop the monitoring loop and wait for it to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn check(runtime: &DbRuntime, callbacks: &Mutex<Vec<MonitorCallback>>) {
        let diagnostics = match Diagnostics::collect(runtime) {
            Ok(diagnostics) => diagnostics,
            Err(_) => return, // disconnected; nothing to report
        };
        let health = check_health(runtime).await;

        let registered: Vec<MonitorCallback> = callbacks.lock().clone();
        let dispatch = |event: MonitorEvent| {
            for callback in &registered {
                callback(&event);
            }
        };

        dispatch(MonitorEvent::PeriodicCheck {
            diagnostics: diagnostics.clone(),
            health: health.clone(),
        });

        if !health.healthy {
            warn!(message = %health.message, "Runtime health warning");
            dispatch(MonitorEvent::HealthWarning {
                message: health.message.clone(),
            });
        }

        let slow = diagnostics.metrics.slow_queries;
        if slow > 0 {
            warn!(total = slow, "Slow queries detected");
            dispatch(MonitorEvent::SlowQueries { total: slow });
        }

        if diagnostics.circuit_state == CircuitState::Open {
            error!("Circuit breaker is open");
            dispatch(MonitorEvent::CircuitOpen);
        }
    }
}

/// A stock callback that logs each event through `tracing`.
pub fn default_logging_callback() -> MonitorCallback {
    Arc::new(|event: &MonitorEvent| match event {
        MonitorEvent::HealthWarning { message } => {
            warn!(message = %message, "Health warning");
        }
        MonitorEvent::CircuitOpen => {
            error!("Circuit breaker is open");
        }
        MonitorEvent::SlowQueries { total } => {
            warn!(total, "Slow queries detected");
        }
        MonitorEvent::PeriodicCheck { diagnostics, .. } => {
            info!(
                in_use = diagnostics.pool.in_use,
                open = diagnostics.pool.open_connections,
                queries = diagnostics.metrics.total_queries,
                success_rate = format!("{:.2}", diagnostics.success_rate),
                "Periodic check"
            );
        }
    })
}
