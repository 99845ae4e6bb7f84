//! Protocol message types for agent communication.
//!
//! Every message is a single JSON object on its own line. A connection
//! opens with a handshake, after which the host sends [`RpcRequest`]s and
//! reads exactly one [`RpcResponse`] per request.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum size of a single protocol line (1 MB).
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Session id sent by a host that does not have one yet.
pub const UNKNOWN_UID: i64 = -1;

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while encoding or decoding a protocol line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The line is not valid JSON, or not a JSON object.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// A field the protocol requires is absent or has the wrong type.
    #[error("missing or malformed field: {0}")]
    MissingField(&'static str),

    /// A value could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl WireError {
    fn invalid_json<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidJson(err.to_string())
    }
}

fn parse_object(line: &str) -> Result<serde_json::Map<String, Value>, WireError> {
    match serde_json::from_str::<Value>(line.trim()).map_err(WireError::invalid_json)? {
        Value::Object(map) => Ok(map),
        other => Err(WireError::InvalidJson(format!("expected object, got {other}"))),
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Handshake command opening a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeCommand {
    /// Start a new session; the agent assigns the uid.
    Initiate,
    /// Attach an additional connection to an existing session.
    Continue,
}

/// First message sent on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub cmd: HandshakeCommand,
    pub uid: i64,
}

impl HandshakeRequest {
    /// Creates a request for a brand-new session.
    pub fn initiate() -> Self {
        Self {
            cmd: HandshakeCommand::Initiate,
            uid: UNKNOWN_UID,
        }
    }

    /// Creates a request attaching to session `uid`.
    pub fn resume(uid: i64) -> Self {
        Self {
            cmd: HandshakeCommand::Continue,
            uid,
        }
    }

    /// Serializes the request as one protocol line (without the newline).
    pub fn to_line(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Encode(e.to_string()))
    }
}

/// Agent reply to a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Session id assigned (or confirmed) by the agent.
    pub uid: i64,

    /// Whether the agent accepted the handshake, when it says so.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<bool>,
}

impl HandshakeResponse {
    /// Parses a handshake reply line.
    ///
    /// # Errors
    ///
    /// - `WireError::InvalidJson` if the line is not a JSON object
    /// - `WireError::MissingField("uid")` if no integer uid is present
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let map = parse_object(line)?;
        let uid = map
            .get("uid")
            .and_then(Value::as_i64)
            .ok_or(WireError::MissingField("uid"))?;
        let status = map.get("status").and_then(Value::as_bool);
        Ok(Self { uid, status })
    }

    /// Returns false only when the agent explicitly refused the handshake.
    pub fn is_accepted(&self) -> bool {
        self.status.unwrap_or(true)
    }
}

// ============================================================================
// Method calls
// ============================================================================

/// An outbound method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Request id, unique and strictly increasing within one connection.
    pub id: u64,
    /// Remote method name.
    pub method: String,
    /// Positional arguments.
    pub params: Vec<Value>,
}

impl RpcRequest {
    /// Creates a new request.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Serializes the request as one protocol line (without the newline).
    pub fn to_line(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Encode(e.to_string()))
    }
}

/// An inbound reply to an [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Id of the request this answers. Absent on malformed replies.
    #[serde(default)]
    pub id: Option<u64>,

    /// Return value; `None` when absent or `null`.
    #[serde(default)]
    pub result: Option<Value>,

    /// Remote failure; `None` when absent or `null`.
    #[serde(default)]
    pub error: Option<Value>,
}

/// Interpretation of a response's `result`/`error` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutcome {
    /// The call returned a value.
    Value(Value),
    /// The call succeeded without a return value.
    Empty,
    /// The agent reported a failure; carries the error text verbatim.
    Remote(String),
}

impl RpcResponse {
    /// Parses a response line.
    ///
    /// # Errors
    ///
    /// Returns `WireError::InvalidJson` if the line is not a JSON object.
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let map = parse_object(line)?;
        let id = map.get("id").and_then(Value::as_u64);
        let result = map.get("result").filter(|v| !v.is_null()).cloned();
        let error = map.get("error").filter(|v| !v.is_null()).cloned();
        Ok(Self { id, result, error })
    }

    /// Returns true if this response answers request `id`.
    pub fn answers(&self, id: u64) -> bool {
        self.id == Some(id)
    }

    /// Consumes the response, classifying it.
    ///
    /// A non-null `error` wins over any `result`. String errors are kept
    /// verbatim; any other JSON error value is rendered as JSON text.
    pub fn into_outcome(self) -> RpcOutcome {
        match (self.error, self.result) {
            (Some(Value::String(text)), _) => RpcOutcome::Remote(text),
            (Some(other), _) => RpcOutcome::Remote(other.to_string()),
            (None, Some(value)) => RpcOutcome::Value(value),
            (None, None) => RpcOutcome::Empty,
        }
    }
}
