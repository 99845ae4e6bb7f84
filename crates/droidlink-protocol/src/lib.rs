//! droidlink Protocol - Wire protocol for agent communication
//!
//! This crate provides message types and parsing for the line-delimited
//! JSON protocol spoken between the host and a device-resident scripting
//! agent: the session handshake, correlated method calls, and the event
//! payloads returned by the `eventWait` long-poll.
//!
//! No I/O happens here. Framing (one JSON object per line) is the
//! transport's job; this crate only encodes and decodes single lines.

pub mod event;
pub mod message;

pub use event::{Event, EventParseError, EVENT_WAIT_METHOD, SHUTDOWN_EVENT};
pub use message::{
    HandshakeCommand, HandshakeRequest, HandshakeResponse, RpcOutcome, RpcRequest, RpcResponse,
    WireError, MAX_MESSAGE_SIZE, UNKNOWN_UID,
};
