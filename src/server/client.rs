// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! TCP client for the gateway wire protocol.
//!
//! One request/response exchange at a time per connection; the client
//! verifies that every response id matches the request id and surfaces a
//! protocol error on mismatch.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::GatewayError;
use crate::types::{ExecResult, MetricsResult, QueryResult, SqlValue, StatsResult};

use super::protocol::{
    decode_response, encode_request, map_codec_error, Request, Response, MAX_FRAME_BYTES,
};

/// A connected protocol client.
pub struct TcpClient {
    framed: Framed<TcpStream, LinesCodec>,
}

impl TcpClient {
    /// Connect to a gateway server.
    pub async fn connect(addr: &str) -> Result<Self, GatewayError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
        })
    }

    /// Send one request and read its response, verifying id correlation.
    pub async fn call(&mut self, request: &Request) -> Result<Response, GatewayError> {
        let line = encode_request(request)?;
        self.framed.send(line).await.map_err(map_codec_error)?;

        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| GatewayError::Protocol("connection closed by server".to_string()))?
            .map_err(map_codec_error)?;

        let response = decode_response(&frame)?;
        if response.id != request.id {
            return Err(GatewayError::Protocol(format!(
                "response id {:?} does not match request id {:?}",
                response.id, request.id
            )));
        }
        Ok(response)
    }

    /// Health probe.
    pub async fn ping(&mut self, id: impl Into<String>) -> Result<(), GatewayError> {
        let response = self.call(&Request::ping(id)).await?;
        expect_success(response).map(|_| ())
    }

    /// Execute a statement returning no rows.
    pub async fn exec(
        &mut self,
        id: impl Into<String>,
        query: impl Into<String>,
        args: Vec<SqlValue>,
    ) -> Result<ExecResult, GatewayError> {
        let response = self.call(&Request::exec(id, query, args)).await?;
        parse_payload(expect_success(response)?)
    }

    /// Execute a statement and fetch all rows.
    pub async fn query(
        &mut self,
        id: impl Into<String>,
        query: impl Into<String>,
        args: Vec<SqlValue>,
    ) -> Result<QueryResult, GatewayError> {
        let response = self.call(&Request::query(id, query, args)).await?;
        parse_payload(expect_success(response)?)
    }

    /// Fetch pool statistics.
    pub async fn stats(&mut self, id: impl Into<String>) -> Result<StatsResult, GatewayError> {
        let response = self.call(&Request::stats(id)).await?;
        parse_payload(expect_success(response)?)
    }

    /// Fetch query metrics.
    pub async fn metrics(&mut self, id: impl Into<String>) -> Result<MetricsResult, GatewayError> {
        let response = self.call(&Request::metrics(id)).await?;
        parse_payload(expect_success(response)?)
    }

    /// Send `CLOSE` and drop the connection. The server replies nothing.
    pub async fn close(mut self) -> Result<(), GatewayError> {
        let line = encode_request(&Request::close())?;
        self.framed.send(line).await.map_err(map_codec_error)?;
        Ok(())
    }
}

fn expect_success(response: Response) -> Result<serde_json::Value, GatewayError> {
    if !response.success {
        return Err(GatewayError::QueryFailed {
            message: response.error,
            source: None,
        });
    }
    response
        .data
        .ok_or_else(|| GatewayError::Protocol("success response missing data".to_string()))
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> Result<T, GatewayError> {
    serde_json::from_value(value)
        .map_err(|err| GatewayError::Protocol(format!("failed to parse payload: {}", err)))
}

/// Parse an `EXEC` payload from raw response data.
pub fn parse_exec_result(value: serde_json::Value) -> Result<ExecResult, GatewayError> {
    parse_payload(value)
}

/// Parse a `QUERY` payload from raw response data.
pub fn parse_query_result(value: serde_json::Value) -> Result<QueryResult, GatewayError> {
    parse_payload(value)
}

/// Parse a `STATS` payload from raw response data.
pub fn parse_stats_result(value: serde_json::Value) -> Result<StatsResult, GatewayError> {
    parse_payload(value)
}

/// Parse a `METRICS` payload from raw response data.
pub fn parse_metrics_result(value: serde_json::Value) -> Result<MetricsResult, GatewayError> {
    parse_payload(value)
}
