//! Error types for the droidlink client.
//!
//! Every fallible operation in this crate returns [`ClientError`]. The
//! variants follow where the failure happened: on the socket, inside the
//! agent, in the bytes on the wire, during agent start-up, or in the `adb`
//! bridge.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;

use droidlink_protocol::{EventParseError, WireError};
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors raised by the transport, RPC client, dispatcher and session.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The transport could not be established, or was lost outside a call.
    #[error("connection error: {0}")]
    Connection(String),

    /// The agent answered a call with a non-null `error`.
    ///
    /// Carries the agent's error text verbatim.
    #[error("remote error: {0}")]
    Remote(String),

    /// A reply could not be parsed, or did not match its request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The agent did not report itself running after launch.
    #[error("agent failed to start: {0}")]
    Startup(String),

    /// An `adb` invocation failed.
    #[error("device bridge error: {0}")]
    Bridge(String),

    /// The configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The event queue actor has shut down.
    #[error("event queue closed")]
    QueueClosed,

    /// I/O error passthrough.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Creates a connection error from any displayable error.
    pub fn connection<E: std::fmt::Display>(err: E) -> Self {
        Self::Connection(err.to_string())
    }

    /// Returns true for failures of the socket itself.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_))
    }
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<EventParseError> for ClientError {
    fn from(err: EventParseError) -> Self {
        Self::Protocol(err.to_string())
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
