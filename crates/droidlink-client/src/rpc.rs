//! RPC client: correlated request/response calls over one transport.
//!
//! The protocol does not pipeline. Each call sends one request and reads
//! exactly one reply, so the transport sits behind an async mutex held for
//! the whole round trip; concurrent callers queue up on it.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use droidlink_protocol::{HandshakeRequest, HandshakeResponse, RpcOutcome, RpcRequest, RpcResponse};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{ClientError, Result};
use crate::transport::LineTransport;

/// Transport plus the bookkeeping guarded with it.
struct Connection {
    transport: Box<dyn LineTransport>,

    /// Set while a request is on the wire and its reply not yet read.
    /// Still set at the start of a call means an earlier call was dropped
    /// mid-flight and its reply may still be unread in the socket.
    in_flight: bool,
}

/// Client issuing method calls to the agent.
///
/// Request ids start at 1 and grow by one per call, including the
/// handshake and calls that fail. Clients built with
/// [`RpcClient::with_counter`] draw from one shared counter, so ids stay
/// unique across every connection of a session.
///
/// # Example
///
/// ```rust,ignore
/// let client = RpcClient::new(Box::new(transport));
/// client.handshake(HandshakeRequest::initiate()).await?;
/// let version = client.call("getBuildVersion", vec![]).await?;
/// ```
pub struct RpcClient {
    connection: Mutex<Connection>,

    /// Last request id handed out, possibly shared with sibling clients.
    last_id: Arc<AtomicU64>,
}

impl RpcClient {
    /// Creates a client with its own id counter.
    pub fn new(transport: Box<dyn LineTransport>) -> Self {
        Self::with_counter(transport, Arc::new(AtomicU64::new(0)))
    }

    /// Creates a client drawing request ids from `counter`.
    pub fn with_counter(transport: Box<dyn LineTransport>, counter: Arc<AtomicU64>) -> Self {
        Self {
            connection: Mutex::new(Connection {
                transport,
                in_flight: false,
            }),
            last_id: counter,
        }
    }

    /// Number of request ids handed out so far on this client's counter.
    pub fn request_count(&self) -> u64 {
        self.last_id.load(Ordering::SeqCst)
    }

    /// Performs the connection handshake.
    ///
    /// The handshake line has no `id` field, but it still uses up one
    /// request id, so the first ordinary call after it is id 2.
    ///
    /// # Errors
    ///
    /// - `ClientError::Connection` if the transport fails
    /// - `ClientError::Protocol` if the reply is malformed or refuses the handshake
    pub async fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
        let mut connection = self.connection.lock().await;
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(id, cmd = ?request.cmd, "Sending handshake");

        let line = request.to_line()?;
        let reply = Self::round_trip(&mut connection, &line).await?;
        drop(connection);

        let response = HandshakeResponse::parse(&reply)?;
        if !response.is_accepted() {
            return Err(ClientError::Protocol(format!(
                "agent refused {:?} handshake for uid {}",
                request.cmd, request.uid
            )));
        }

        debug!(uid = response.uid, cmd = ?request.cmd, "Handshake complete");
        Ok(response)
    }

    /// Calls `method` with positional `params`.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(value))` - The call returned a value
    /// * `Ok(None)` - The call returned nothing (`result` absent or null)
    ///
    /// # Errors
    ///
    /// - `ClientError::Remote` if the agent reported an error
    /// - `ClientError::Connection` if the transport failed
    /// - `ClientError::Protocol` if the reply was malformed or answered another id
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Option<Value>> {
        let mut connection = self.connection.lock().await;

        // Taken under the lock so ids reach the wire in order.
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = RpcRequest::new(id, method, params);
        trace!(id, method, "Sending request");

        let line = request.to_line()?;
        let reply = Self::round_trip(&mut connection, &line).await?;
        drop(connection);

        let response = RpcResponse::parse(&reply)?;
        if !response.answers(id) {
            warn!(expected = id, got = ?response.id, method, "Response id mismatch");
            return Err(ClientError::Protocol(format!(
                "response id {:?} does not match request id {id}",
                response.id
            )));
        }

        match response.into_outcome() {
            RpcOutcome::Value(value) => Ok(Some(value)),
            RpcOutcome::Empty => Ok(None),
            RpcOutcome::Remote(message) => {
                debug!(id, method, error = %message, "Remote call failed");
                Err(ClientError::Remote(message))
            }
        }
    }

    /// Closes the underlying transport.
    pub async fn close(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        connection.transport.close().await
    }

    async fn round_trip(connection: &mut Connection, line: &str) -> Result<String> {
        if connection.in_flight {
            return Err(ClientError::connection(
                "connection out of sync: an earlier call was abandoned before its reply",
            ));
        }

        // Only a dropped future leaves the flag set; errors clear it.
        connection.in_flight = true;
        let result = match connection.transport.send_line(line).await {
            Ok(()) => connection.transport.receive_line().await,
            Err(e) => Err(e),
        };
        connection.in_flight = false;
        result
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("request_count", &self.request_count())
            .finish()
    }
}
