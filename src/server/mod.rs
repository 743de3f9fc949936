//! Line-delimited JSON TCP front end.
//!
//! One task per connection; requests on a connection are served
//! sequentially, so responses leave in arrival order. The accept loop and
//! every connection task watch the same shutdown signal, and `stop()`
//! returns only after all of them have finished.
//!
//! Request flow: framing → per-IP admission → idempotency lookup →
//! dispatch to the backend → response emission. An idempotent replay
//! re-emits the stored outcome (`success`/`error`/`data`, byte-identical
//! payload) under the replaying request's own id, so id correlation holds
//! for every emitted response.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, InMemoryCache};
use crate::db::QueryBackend;
use crate::error::GatewayError;

pub mod admission;
pub mod client;
pub mod protocol;

use admission::AdmissionControl;
use protocol::{
    decode_request, encode_response, MessageType, Request, Response, MAX_FRAME_BYTES,
};

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(300);
const IDEMPOTENCY_CAPACITY: usize = 10_000;

/// TCP server configuration.
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Bind address; port 0 selects an ephemeral port.
    pub address: String,
    pub enable_idempotency: bool,
    pub enable_ddos_protection: bool,
    /// Per-request byte ceiling; zero disables the check.
    pub max_request_size: u64,
    /// Per-IP concurrent connection ceiling; zero means unlimited.
    pub max_connections_per_ip: usize,
    /// Per-IP request gate; zero disables it. Any non-zero value admits at
    /// most one request per second per IP (trailing edge).
    pub rate_limit_per_ip: u64,
    pub blacklisted_ips: Vec<IpAddr>,
    pub whitelisted_ips: Vec<IpAddr>,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:0".to_string(),
            enable_idempotency: false,
            enable_ddos_protection: false,
            max_request_size: 0,
            max_connections_per_ip: 0,
            rate_limit_per_ip: 0,
            blacklisted_ips: Vec::new(),
            whitelisted_ips: Vec::new(),
        }
    }
}

struct Shared {
    config: TcpServerConfig,
    backend: Arc<dyn QueryBackend>,
    admission: AdmissionControl,
    idempotency: Option<InMemoryCache<Response>>,
    client_count: AtomicU64,
}

struct ServerState {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

/// The gateway's TCP request server.
pub struct TcpServer {
    shared: Arc<Shared>,
    state: Mutex<Option<ServerState>>,
}

impl TcpServer {
    pub fn new(config: TcpServerConfig, backend: Arc<dyn QueryBackend>) -> Self {
        let admission = AdmissionControl::new(
            config.max_connections_per_ip,
            config.rate_limit_per_ip,
            config.blacklisted_ips.iter().copied(),
            config.whitelisted_ips.iter().copied(),
        );
        let idempotency = config.enable_idempotency.then(|| {
            InMemoryCache::new("idempotency", IDEMPOTENCY_CAPACITY, IDEMPOTENCY_TTL)
        });

        Self {
            shared: Arc::new(Shared {
                config,
                backend,
                admission,
                idempotency,
                client_count: AtomicU64::new(0),
            }),
            state: Mutex::new(None),
        }
    }

    /// Bind and start accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, GatewayError> {
        if self.state.lock().is_some() {
            return Err(GatewayError::Protocol("server already started".to_string()));
        }

        let listener = TcpListener::bind(&self.shared.config.address).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let accept_task = tokio::spawn(accept_loop(listener, shared, shutdown_rx));

        *self.state.lock() = Some(ServerState {
            local_addr,
            shutdown,
            accept_task,
        });
        info!(address = %local_addr, "TCP server listening");
        Ok(local_addr)
    }

    /// Signal shutdown, close all connections, and wait for every
    /// per-connection task to finish. Idempotent.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let state = self.state.lock().take();
        let Some(state) = state else {
            return Ok(());
        };

        let _ = state.shutdown.send(true);
        let _ = state.accept_task.await;
        info!("TCP server stopped");
        Ok(())
    }

    /// The bound address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|state| state.local_addr)
    }

    /// Currently connected clients.
    #[must_use]
    pub fn client_count(&self) -> u64 {
        self.shared.client_count.load(Ordering::Acquire)
    }

    /// Idempotency cache statistics, when enabled.
    #[must_use]
    pub fn idempotency_stats(&self) -> Option<CacheStats> {
        self.shared.idempotency.as_ref().map(InMemoryCache::stats)
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("address", &self.local_addr())
            .field("clients", &self.client_count())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(handle_client(
                            stream,
                            peer,
                            shared.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(err) => {
                        warn!(error = %err, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Stop accepting, then wait for every connection task; each observes
    // the same shutdown signal.
    drop(listener);
    while connections.join_next().await.is_some() {}
    debug!("Accept loop finished");
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ip = peer.ip();
    let count = shared.client_count.fetch_add(1, Ordering::AcqRel) + 1;
    crate::metrics::set_connected_clients(count);
    info!(peer = %peer, "Client connected");

    let _ip_guard = if shared.config.enable_ddos_protection {
        match shared.admission.admit_connection(ip) {
            Ok(guard) => Some(guard),
            Err(rejection) => {
                warn!(ip = %ip, reason = %rejection, "Connection blocked by DDoS protection");
                finish_client(&shared, peer);
                return;
            }
        }
    } else {
        None
    };

    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = framed.next() => {
                match frame {
                    None => break,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        // Framing itself failed: protocol error, then close
                        warn!(peer = %peer, "Oversize frame");
                        let response =
                            Response::failure("", "PROTOCOL_ERROR: frame exceeds maximum length");
                        if let Ok(encoded) = encode_response(&response) {
                            let _ = framed.send(encoded).await;
                        }
                        break;
                    }
                    Some(Err(LinesCodecError::Io(err))) => {
                        warn!(peer = %peer, error = %err, "Read failed");
                        break;
                    }
                    Some(Ok(line)) => {
                        match handle_line(&shared, ip, &line).await {
                            LineOutcome::Close => break,
                            LineOutcome::Reply(encoded) => {
                                if framed.send(encoded).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    info!(peer = %peer, "Client disconnected");
    finish_client(&shared, peer);
}

fn finish_client(shared: &Shared, peer: SocketAddr) {
    let count = shared.client_count.fetch_sub(1, Ordering::AcqRel) - 1;
    crate::metrics::set_connected_clients(count);
    debug!(peer = %peer, remaining = count, "Connection finished");
}

enum LineOutcome {
    Reply(String),
    Close,
}

fn reply(response: Response) -> LineOutcome {
    match encode_response(&response) {
        Ok(encoded) => LineOutcome::Reply(encoded),
        Err(_) => LineOutcome::Reply(
            r#"{"id":"","success":false,"error":"PROTOCOL_ERROR: encoding failure"}"#.to_string(),
        ),
    }
}

async fn handle_line(shared: &Shared, ip: IpAddr, line: &str) -> LineOutcome {
    let request_size = line.len() as u64;
    let mut request = match decode_request(line) {
        Ok(request) => request,
        Err(err) => {
            warn!(ip = %ip, error = %err, "Failed to decode frame");
            return reply(Response::failure("", err.to_string()));
        }
    };
    request.request_size = request_size;
    request.client_ip = Some(ip);

    if request.kind == MessageType::Close.as_str() {
        debug!(ip = %ip, "Client requested close");
        return LineOutcome::Close;
    }

    if request.id.is_empty() {
        return reply(Response::failure("", "PROTOCOL_ERROR: missing request id"));
    }

    if shared.config.enable_ddos_protection {
        let max = shared.config.max_request_size;
        if max > 0 && request.request_size > max {
            let err = GatewayError::RequestTooLarge {
                size: request.request_size,
                max,
            };
            return reply(Response::failure(&request.id, err.to_string()));
        }
        if !shared.admission.check_request_rate(ip) {
            return reply(Response::failure(
                &request.id,
                format!("RATE_LIMIT_EXCEEDED: rate limit exceeded for IP: {}", ip),
            ));
        }
    }

    let idempotency_key =
        (!request.idempotency_key.is_empty()).then(|| request.idempotency_key.clone());

    if let (Some(cache), Some(key)) = (&shared.idempotency, &idempotency_key) {
        if let Some(mut cached) = cache.get(key) {
            debug!(key = %key, "Replaying idempotent response");
            // The stored outcome replays verbatim, but every response must
            // carry its own request's id
            cached.id = request.id.clone();
            return reply(cached);
        }
    }

    let response = dispatch(shared, &request).await;
    crate::metrics::record_request(
        &request.kind,
        if response.success { "success" } else { "error" },
    );

    // Stored whole (success or error) so the replayed payload is
    // byte-identical
    if let (Some(cache), Some(key)) = (&shared.idempotency, &idempotency_key) {
        cache.set(key, response.clone(), IDEMPOTENCY_TTL);
    }

    reply(response)
}

fn payload_response<T: Serialize>(id: &str, data: &T) -> Response {
    Response::ok(id, data).unwrap_or_else(|err| Response::failure(id, err.to_string()))
}

async fn dispatch(shared: &Shared, request: &Request) -> Response {
    let id = request.id.as_str();

    match MessageType::parse(&request.kind) {
        Some(MessageType::Ping) => {
            payload_response(id, &serde_json::json!({"status": "ok"}))
        }
        Some(MessageType::Exec) => {
            if request.query.is_empty() {
                return Response::failure(id, "PROTOCOL_ERROR: missing query");
            }
            match shared.backend.exec(&request.query, &request.args).await {
                Ok(result) => payload_response(id, &result),
                Err(err) => Response::failure(id, err.to_string()),
            }
        }
        Some(MessageType::Query) => {
            if request.query.is_empty() {
                return Response::failure(id, "PROTOCOL_ERROR: missing query");
            }
            match shared.backend.query(&request.query, &request.args).await {
                Ok(result) => payload_response(id, &result),
                Err(err) => Response::failure(id, err.to_string()),
            }
        }
        Some(MessageType::Stats) => match shared.backend.stats() {
            Ok(stats) => payload_response(id, &stats),
            Err(err) => Response::failure(id, err.to_string()),
        },
        Some(MessageType::Metrics) => match shared.backend.metrics() {
            Ok(metrics) => payload_response(id, &metrics),
            Err(err) => Response::failure(id, err.to_string()),
        },
        // CLOSE is intercepted before dispatch
        Some(MessageType::Close) => Response::failure(id, "PROTOCOL_ERROR: unexpected CLOSE"),
        None => Response::failure(id, format!("unknown message type: {}", request.kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::client::TcpClient;
    use crate::types::{ExecResult, MetricsResult, QueryResult, SqlValue, StatsResult};
    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Backend that counts calls and returns canned results.
    struct CountingBackend {
        exec_calls: AtomicU64,
        query_calls: AtomicU64,
        fail_exec: bool,
    }

    impl CountingBackend {
        fn new() -> Self {
            Self {
                exec_calls: AtomicU64::new(0),
                query_calls: AtomicU64::new(0),
                fail_exec: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail_exec: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl QueryBackend for CountingBackend {
        async fn exec(&self, _sql: &str, _args: &[SqlValue]) -> Result<ExecResult, GatewayError> {
            self.exec_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_exec {
                return Err(GatewayError::QueryFailed {
                    message: "injected".into(),
                    source: None,
                });
            }
            Ok(ExecResult {
                rows_affected: 1,
                last_insert_id: 1,
            })
        }

        async fn query(&self, _sql: &str, _args: &[SqlValue]) -> Result<QueryResult, GatewayError> {
            self.query_calls.fetch_add(1, Ordering::SeqCst);
            Ok(QueryResult {
                columns: vec!["id".into()],
                rows: vec![vec![SqlValue::Int(1)]],
            })
        }

        fn stats(&self) -> Result<StatsResult, GatewayError> {
            Ok(StatsResult::default())
        }

        fn metrics(&self) -> Result<MetricsResult, GatewayError> {
            Ok(MetricsResult::default())
        }
    }

    async fn started(config: TcpServerConfig) -> (TcpServer, Arc<CountingBackend>, String) {
        let backend = Arc::new(CountingBackend::new());
        let server = TcpServer::new(config, backend.clone());
        let addr = server.start().await.unwrap();
        (server, backend, addr.to_string())
    }

    #[tokio::test]
    async fn test_ping_round_trip_exact_bytes() {
        let (server, _, addr) = started(TcpServerConfig::default()).await;

        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"{\"type\":\"PING\",\"id\":\"1\"}\n").await.unwrap();

        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"id":"1","success":true,"data":{"status":"ok"}}"#);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_and_query_dispatch() {
        let (server, backend, addr) = started(TcpServerConfig::default()).await;
        let mut client = TcpClient::connect(&addr).await.unwrap();

        let exec = client
            .exec("a", "INSERT INTO t VALUES (?)", vec![SqlValue::Int(1)])
            .await
            .unwrap();
        assert_eq!(exec.rows_affected, 1);
        assert_eq!(backend.exec_calls.load(Ordering::SeqCst), 1);

        let query = client.query("b", "SELECT id FROM t", vec![]).await.unwrap();
        assert_eq!(query.columns, vec!["id"]);
        assert_eq!(backend.query_calls.load(Ordering::SeqCst), 1);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_kind_names_it() {
        let (server, _, addr) = started(TcpServerConfig::default()).await;

        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        write
            .write_all(b"{\"type\":\"UPGRADE\",\"id\":\"9\"}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let response = protocol::decode_response(&line).unwrap();
        assert_eq!(response.id, "9");
        assert!(!response.success);
        assert!(response.error.contains("unknown message type: UPGRADE"));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_idempotency_replays_data_under_new_id() {
        let config = TcpServerConfig {
            enable_idempotency: true,
            ..TcpServerConfig::default()
        };
        let (server, backend, addr) = started(config).await;
        let mut client = TcpClient::connect(&addr).await.unwrap();

        let first = client
            .call(&Request::exec("a", "INSERT", vec![]).with_idempotency_key("pay-42"))
            .await
            .unwrap();
        assert!(first.success);
        assert_eq!(first.data.as_ref().unwrap()["rows_affected"], 1);

        let second = client
            .call(&Request::exec("b", "INSERT", vec![]).with_idempotency_key("pay-42"))
            .await
            .unwrap();

        // The replay correlates with ITS request, carries the first
        // response's payload byte for byte, and the backend ran exactly once
        assert_eq!(second.id, "b");
        assert!(second.success);
        assert_eq!(
            serde_json::to_string(&second.data).unwrap(),
            serde_json::to_string(&first.data).unwrap()
        );
        assert_eq!(backend.exec_calls.load(Ordering::SeqCst), 1);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_idempotency_caches_error_responses() {
        let backend = Arc::new(CountingBackend::failing());
        let server = TcpServer::new(
            TcpServerConfig {
                enable_idempotency: true,
                ..TcpServerConfig::default()
            },
            backend.clone(),
        );
        let addr = server.start().await.unwrap().to_string();
        let mut client = TcpClient::connect(&addr).await.unwrap();

        let first = client
            .call(&Request::exec("a", "INSERT", vec![]).with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(!first.success);

        let second = client
            .call(&Request::exec("b", "INSERT", vec![]).with_idempotency_key("k"))
            .await
            .unwrap();
        assert_eq!(second.id, "b");
        assert!(!second.success);
        assert_eq!(second.error, first.error);
        assert_eq!(backend.exec_calls.load(Ordering::SeqCst), 1);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_too_large() {
        let config = TcpServerConfig {
            enable_ddos_protection: true,
            max_request_size: 64,
            ..TcpServerConfig::default()
        };
        let (server, _, addr) = started(config).await;
        let mut client = TcpClient::connect(&addr).await.unwrap();

        let padding = "x".repeat(128);
        let response = client
            .call(&Request::exec("big", padding, vec![]))
            .await
            .unwrap();
        assert!(!response.success);
        assert!(response.error.contains("REQUEST_TOO_LARGE"));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_per_ip_rate_gate() {
        let config = TcpServerConfig {
            enable_ddos_protection: true,
            rate_limit_per_ip: 100, // any non-zero value gates at 1 rps
            ..TcpServerConfig::default()
        };
        let (server, _, addr) = started(config).await;
        let mut client = TcpClient::connect(&addr).await.unwrap();

        let first = client.call(&Request::ping("1")).await.unwrap();
        assert!(first.success);

        let second = client.call(&Request::ping("2")).await.unwrap();
        assert!(!second.success);
        assert!(second.error.contains("RATE_LIMIT_EXCEEDED"));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_blacklisted_connection_is_dropped() {
        let config = TcpServerConfig {
            enable_ddos_protection: true,
            blacklisted_ips: vec!["127.0.0.1".parse().unwrap()],
            ..TcpServerConfig::default()
        };
        let (server, _, addr) = started(config).await;

        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let _ = write.write_all(b"{\"type\":\"PING\",\"id\":\"1\"}\n").await;
        let mut lines = BufReader::new(read).lines();
        // Server closes without replying
        assert_eq!(lines.next_line().await.unwrap(), None);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_terminates_without_reply() {
        let (server, _, addr) = started(TcpServerConfig::default()).await;

        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"{\"type\":\"CLOSE\",\"id\":\"\"}\n").await.unwrap();
        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap(), None);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_id_is_protocol_error() {
        let (server, _, addr) = started(TcpServerConfig::default()).await;

        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"{\"type\":\"PING\"}\n").await.unwrap();
        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("PROTOCOL_ERROR"));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_connection_open() {
        let (server, _, addr) = started(TcpServerConfig::default()).await;

        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"this is not json\n").await.unwrap();
        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("PROTOCOL_ERROR"));

        // Connection still serves requests
        write.write_all(b"{\"type\":\"PING\",\"id\":\"2\"}\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("\"id\":\"2\""));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_open_connections() {
        let (server, _, addr) = started(TcpServerConfig::default()).await;

        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read, _write) = stream.into_split();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.client_count(), 1);

        server.stop().await.unwrap();

        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap(), None);
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (server, _, _addr) = started(TcpServerConfig::default()).await;
        assert!(server.start().await.is_err());
        server.stop().await.unwrap();
        // After stop the server can start again
        server.start().await.unwrap();
        server.stop().await.unwrap();
    }
}
