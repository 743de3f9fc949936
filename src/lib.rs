//! # sqlgate
//!
//! A resilient database access gateway. It fronts a relational database
//! with three cooperating subsystems:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TCP Request Server                       │
//! │  • Line-delimited JSON frames (1 MiB ceiling)              │
//! │  • Per-IP admission: black/whitelist, conn caps, 1 rps     │
//! │  • Idempotency cache (5 min TTL, byte-identical replay)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Resilience Gate                         │
//! │  • Circuit breaker (closed / open / half-open)             │
//! │  • Token-bucket rate limiter (10 s burst)                  │
//! │  • Concurrency limiter (drop / block / timeout)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Managed DB Facade                         │
//! │  • Pool with validation, warm-up, leak tracking            │
//! │  • Retry with exponential backoff, per-call deadlines      │
//! │  • Prepared-statement cache, LRU+TTL result cache          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sqlgate::{ConfigBuilder, DbRuntime, SqlValue, TcpServer, TcpServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigBuilder::new()
//!         .with_dsn("sqlite::memory:")
//!         .build();
//!
//!     let runtime = Arc::new(DbRuntime::new(config));
//!     runtime.connect().await?;
//!
//!     runtime
//!         .exec("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", &[])
//!         .await?;
//!     runtime
//!         .exec("INSERT INTO users (name) VALUES (?)", &[SqlValue::from("ada")])
//!         .await?;
//!
//!     let server = TcpServer::new(
//!         TcpServerConfig {
//!             address: "127.0.0.1:4040".into(),
//!             enable_idempotency: true,
//!             ..Default::default()
//!         },
//!         runtime.clone(),
//!     );
//!     let addr = server.start().await?;
//!     println!("gateway listening on {addr}");
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     runtime.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Design notes
//!
//! - There is no library-level global state; everything lives inside a
//!   constructed [`DbRuntime`] or [`TcpServer`] and is torn down by
//!   `disconnect()` / `stop()`.
//! - Gate slots release on every exit path, including cancellation: a
//!   dropped future drops its permit.
//! - The wire protocol is unauthenticated and unencrypted; production
//!   deployments must layer TLS and an auth handshake over the framing.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod resilience;
pub mod server;
pub mod types;

pub use cache::{CacheStats, InMemoryCache};
pub use config::{ConfigBuilder, DatabaseDialect, RuntimeConfig};
pub use db::{DbRuntime, GatewayTransaction, QueryBackend};
pub use error::GatewayError;
pub use monitor::{check_health, Diagnostics, HealthStatus, Monitor, MonitorEvent};
pub use resilience::{
    BackpressureMode, CircuitBreaker, CircuitState, ConnectionGate, GateConfig, RetryPolicy,
};
pub use server::client::TcpClient;
pub use server::protocol::{MessageType, Request, Response, MAX_FRAME_BYTES};
pub use server::{TcpServer, TcpServerConfig};
pub use types::{ExecResult, MetricsResult, QueryResult, SqlValue, StatsResult};
