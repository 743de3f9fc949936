// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Line-delimited JSON wire protocol.
//!
//! One JSON object per line, terminated by a single `\n`. Frames longer
//! than [`MAX_FRAME_BYTES`] are rejected by the codec. The request `type`
//! travels as a raw string so an unknown kind can be echoed back in the
//! error response instead of failing decode.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tokio_util::codec::LinesCodecError;

use crate::error::GatewayError;
use crate::types::SqlValue;

/// Maximum wire frame length in bytes (1 MiB).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Known request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ping,
    Exec,
    Query,
    Stats,
    Metrics,
    Close,
}

impl MessageType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Exec => "EXEC",
            Self::Query => "QUERY",
            Self::Stats => "STATS",
            Self::Metrics => "METRICS",
            Self::Close => "CLOSE",
        }
    }

    #[must_use]
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "PING" => Some(Self::Ping),
            "EXEC" => Some(Self::Exec),
            "QUERY" => Some(Self::Query),
            "STATS" => Some(Self::Stats),
            "METRICS" => Some(Self::Metrics),
            "CLOSE" => Some(Self::Close),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Request kind; raw so unknown kinds survive decode.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<SqlValue>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub idempotency_key: String,
    /// Reserved; ignored by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Frame byte size, filled by the server after framing.
    #[serde(skip)]
    pub request_size: u64,
    /// Peer IP, filled by the server.
    #[serde(skip)]
    pub client_ip: Option<IpAddr>,
}

impl Request {
    #[must_use]
    pub fn new(kind: MessageType, id: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            id: id.into(),
            query: String::new(),
            args: Vec::new(),
            idempotency_key: String::new(),
            payload: None,
            request_size: 0,
            client_ip: None,
        }
    }

    #[must_use]
    pub fn ping(id: impl Into<String>) -> Self {
        Self::new(MessageType::Ping, id)
    }

    #[must_use]
    pub fn exec(id: impl Into<String>, query: impl Into<String>, args: Vec<SqlValue>) -> Self {
        let mut request = Self::new(MessageType::Exec, id);
        request.query = query.into();
        request.args = args;
        request
    }

    #[must_use]
    pub fn query(id: impl Into<String>, query: impl Into<String>, args: Vec<SqlValue>) -> Self {
        let mut request = Self::new(MessageType::Query, id);
        request.query = query.into();
        request.args = args;
        request
    }

    #[must_use]
    pub fn stats(id: impl Into<String>) -> Self {
        Self::new(MessageType::Stats, id)
    }

    #[must_use]
    pub fn metrics(id: impl Into<String>) -> Self {
        Self::new(MessageType::Metrics, id)
    }

    #[must_use]
    pub fn close() -> Self {
        Self::new(MessageType::Close, "")
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }
}

/// A response frame. Exactly one of `error` / `data` is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    /// Successful response with a JSON payload.
    pub fn ok<T: Serialize>(id: impl Into<String>, data: &T) -> Result<Self, GatewayError> {
        let payload = serde_json::to_value(data)
            .map_err(|err| GatewayError::Protocol(format!("failed to encode payload: {}", err)))?;
        Ok(Self {
            id: id.into(),
            success: true,
            error: String::new(),
            data: Some(payload),
        })
    }

    /// Error response carrying a human-readable message.
    #[must_use]
    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            error: message.into(),
            data: None,
        }
    }
}

/// Encode a request to its JSON line (without the trailing newline; the
/// codec appends it).
pub fn encode_request(request: &Request) -> Result<String, GatewayError> {
    serde_json::to_string(request)
        .map_err(|err| GatewayError::Protocol(format!("failed to encode request: {}", err)))
}

/// Decode a request from one JSON line.
pub fn decode_request(line: &str) -> Result<Request, GatewayError> {
    serde_json::from_str(line)
        .map_err(|err| GatewayError::Protocol(format!("failed to decode request: {}", err)))
}

/// Encode a response to its JSON line.
pub fn encode_response(response: &Response) -> Result<String, GatewayError> {
    serde_json::to_string(response)
        .map_err(|err| GatewayError::Protocol(format!("failed to encode response: {}", err)))
}

/// Decode a response from one JSON line.
pub fn decode_response(line: &str) -> Result<Response, GatewayError> {
    serde_json::from_str(line)
        .map_err(|err| GatewayError::Protocol(format!("failed to decode response: {}", err)))
}

/// Map codec failures onto the error taxonomy.
pub(crate) fn map_codec_error(err: LinesCodecError) -> GatewayError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            GatewayError::Protocol("frame exceeds maximum length".to_string())
        }
        LinesCodecError::Io(io) => GatewayError::Transport(io),
    }
}
