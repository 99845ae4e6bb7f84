//! Transport socket layer.
//!
//! A transport carries newline-delimited JSON between the host and the
//! agent. [`TcpTransport`] is the real implementation; the agent is reached
//! through an `adb` port forward managed by [`PortForward`].
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use droidlink_protocol::MAX_MESSAGE_SIZE;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::bridge::DeviceBridge;
use crate::config::ConnectPolicy;
use crate::error::{ClientError, Result};

// ============================================================================
// Line Transport
// ============================================================================

/// A bidirectional, line-framed message channel.
#[async_trait]
pub trait LineTransport: Send {
    /// Writes `line` followed by a newline and flushes.
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Blocks until one full line arrives; the newline is stripped.
    async fn receive_line(&mut self) -> Result<String>;

    /// Closes the channel. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;
}

// ============================================================================
// TCP Transport
// ============================================================================

/// Line transport over a TCP socket.
pub struct TcpTransport {
    peer: SocketAddr,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

impl TcpTransport {
    /// Connects to `addr`, retrying with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Connection` once `policy.max_attempts`
    /// consecutive attempts have failed.
    pub async fn open(addr: SocketAddr, policy: &ConnectPolicy) -> Result<Self> {
        let mut delay = policy.initial_delay();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            debug!(attempt, %addr, "Attempting to connect to agent");

            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    // Small request/response lines; don't wait to coalesce.
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    info!(%addr, attempt, "Connected to agent");
                    return Ok(Self::from_stream(stream, addr));
                }
                Err(e) if attempt >= max_attempts => {
                    return Err(ClientError::Connection(format!(
                        "agent not listening on {addr} after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Connection attempt failed");
                }
            }

            sleep(delay).await;
            delay = policy.next_delay(delay);
        }
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            reader: Some(BufReader::new(reader)),
            writer: Some(writer),
        }
    }

    /// Address of the agent end of the socket.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns false once [`LineTransport::close`] has run.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

#[async_trait]
impl LineTransport for TcpTransport {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ClientError::connection("transport is closed"))?;

        writer
            .write_all(line.as_bytes())
            .await
            .map_err(ClientError::connection)?;
        writer.write_all(b"\n").await.map_err(ClientError::connection)?;
        writer.flush().await.map_err(ClientError::connection)?;
        Ok(())
    }

    async fn receive_line(&mut self) -> Result<String> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ClientError::connection("transport is closed"))?;

        let mut line = String::new();
        let bytes = reader.read_line(&mut line).await.map_err(|e| {
            if e.kind() == ErrorKind::InvalidData {
                ClientError::Protocol(format!("reply is not valid UTF-8: {e}"))
            } else {
                ClientError::connection(e)
            }
        })?;

        if bytes == 0 {
            return Err(ClientError::connection("connection closed by agent"));
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ClientError::Protocol(format!(
                "message too large: {} bytes (max: {MAX_MESSAGE_SIZE})",
                line.len()
            )));
        }

        let trimmed_len = line.trim_end_matches(|c: char| c == '\r' || c == '\n').len();
        line.truncate(trimmed_len);
        Ok(line)
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };

        debug!(peer = %self.peer, "Closing transport");
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            // Peer already hung up; the socket is as closed as it gets.
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(ClientError::connection(e)),
        }
    }
}

// ============================================================================
// Port Forward
// ============================================================================

/// An `adb forward` from a host port to the agent's device port.
pub struct PortForward {
    bridge: Arc<dyn DeviceBridge>,
    host_port: u16,
    device_port: u16,
    active: bool,
}

impl std::fmt::Debug for PortForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForward")
            .field("host_port", &self.host_port)
            .field("device_port", &self.device_port)
            .field("active", &self.active)
            .finish()
    }
}

impl PortForward {
    /// Sets up the forward, picking a free host port when none is given.
    pub async fn establish(
        bridge: Arc<dyn DeviceBridge>,
        host_port: Option<u16>,
        device_port: u16,
    ) -> Result<Self> {
        let host_port = match host_port {
            Some(port) => port,
            None => pick_free_port()?,
        };

        bridge.forward(host_port, device_port).await?;
        info!(host_port, device_port, "Port forward established");

        Ok(Self {
            bridge,
            host_port,
            device_port,
            active: true,
        })
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn device_port(&self) -> u16 {
        self.device_port
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Removes the forward. Removing twice is a no-op.
    pub async fn remove(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        // Marked inactive up front: a failed removal is not retried.
        self.active = false;
        self.bridge.remove_forward(self.host_port).await?;
        debug!(host_port = self.host_port, "Port forward removed");
        Ok(())
    }
}

/// Asks the OS for an unused loopback port.
fn pick_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
