//! Session lifecycle: bring an agent up, talk to it, tear it down.
//!
//! A [`Session`] owns everything one agent connection needs: the port
//! forward, the primary RPC client, a second RPC client attached to the same
//! session for event polling, and the [`EventDispatcher`] running on it.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use droidlink_protocol::HandshakeRequest;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::bridge::DeviceBridge;
use crate::config::SessionConfig;
use crate::dispatcher::{DispatcherConfig, EventDispatcher, EventQueueHandle};
use crate::error::{ClientError, Result};
use crate::rpc::RpcClient;
use crate::transport::{PortForward, TcpTransport};

/// Agent method that ends the session on the device side.
pub const CLOSE_SESSION_METHOD: &str = "closeSl4aSession";

/// How long `close` waits for the agent to acknowledge `closeSl4aSession`.
const CLOSE_SESSION_TIMEOUT: Duration = Duration::from_secs(2);

/// One established connection to a device agent.
///
/// There is no process-wide state: each session has its own request-id
/// counter, shared by both of its connections, and its own queues, so
/// several can run side by side.
pub struct Session {
    config: SessionConfig,
    bridge: Arc<dyn DeviceBridge>,
    forward: PortForward,
    rpc: Arc<RpcClient>,
    event_rpc: Arc<RpcClient>,
    dispatcher: EventDispatcher,
    uid: i64,
}

/// Connections made after the port forward exists.
struct Connected {
    rpc: Arc<RpcClient>,
    event_rpc: Arc<RpcClient>,
    dispatcher: EventDispatcher,
    uid: i64,
}

impl Session {
    /// Installs (when needed), launches and connects to the agent.
    ///
    /// # Errors
    ///
    /// - `ClientError::Bridge` if an `adb` step fails
    /// - `ClientError::Startup` if the agent is not running after launch
    /// - `ClientError::Connection` if the agent never accepts the socket
    /// - `ClientError::Protocol` if a handshake is malformed or refused
    ///
    /// Anything created before a failure is torn down again.
    pub async fn start(config: SessionConfig, bridge: Arc<dyn DeviceBridge>) -> Result<Self> {
        ensure_installed(&config, bridge.as_ref()).await?;

        let launch = config.commands.launch_command(config.device_port);
        info!(device_port = config.device_port, "Launching agent");
        bridge.shell(&launch).await?;

        sleep(config.launch_settle()).await;
        probe_agent(&config, bridge.as_ref()).await?;

        let mut forward =
            PortForward::establish(Arc::clone(&bridge), config.host_port, config.device_port).await?;
        let addr = SocketAddr::new(config.host_address, forward.host_port());

        let connected = match connect(&config, addr).await {
            Ok(connected) => connected,
            Err(e) => {
                warn!(error = %e, %addr, "Agent connection failed, removing port forward");
                if let Err(remove_err) = forward.remove().await {
                    warn!(error = %remove_err, "Failed to remove port forward");
                }
                return Err(e);
            }
        };

        info!(
            uid = connected.uid,
            host_port = forward.host_port(),
            device_port = forward.device_port(),
            "Session started"
        );

        Ok(Self {
            config,
            bridge,
            forward,
            rpc: connected.rpc,
            event_rpc: connected.event_rpc,
            dispatcher: connected.dispatcher,
            uid: connected.uid,
        })
    }

    /// Session id assigned by the agent.
    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn host_port(&self) -> u16 {
        self.forward.host_port()
    }

    pub fn device_port(&self) -> u16 {
        self.forward.device_port()
    }

    /// Client for ordinary calls.
    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Handle for popping and draining events.
    pub fn events(&self) -> &EventQueueHandle {
        self.dispatcher.events()
    }

    /// Calls `method` on the primary connection.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Option<Value>> {
        self.rpc.call(method, params).await
    }

    /// Tears the session down.
    ///
    /// Every step runs even when an earlier one fails. Failures are logged
    /// and never returned.
    pub async fn close(mut self) {
        info!(uid = self.uid, "Closing session");

        match timeout(CLOSE_SESSION_TIMEOUT, self.rpc.call(CLOSE_SESSION_METHOD, vec![])).await {
            Ok(Ok(_)) => debug!("Agent acknowledged session close"),
            Ok(Err(e)) => warn!(error = %e, "Failed to close agent session"),
            Err(_) => warn!("Timed out closing agent session"),
        }

        self.dispatcher.cancel().await;

        if let Err(e) = self.event_rpc.close().await {
            warn!(error = %e, "Failed to close event transport");
        }
        if let Err(e) = self.rpc.close().await {
            warn!(error = %e, "Failed to close transport");
        }

        if let Err(e) = self.bridge.shell(&self.config.commands.stop).await {
            warn!(error = %e, "Failed to stop agent");
        }

        if let Err(e) = self.forward.remove().await {
            warn!(error = %e, "Failed to remove port forward");
        }

        info!(uid = self.uid, "Session closed");
    }

    #[cfg(test)]
    fn from_parts(
        config: SessionConfig,
        bridge: Arc<dyn DeviceBridge>,
        forward: PortForward,
        rpc: Arc<RpcClient>,
        event_rpc: Arc<RpcClient>,
        uid: i64,
    ) -> Self {
        let dispatcher = EventDispatcher::new(Arc::clone(&event_rpc), DispatcherConfig::from(&config));
        Self {
            config,
            bridge,
            forward,
            rpc,
            event_rpc,
            dispatcher,
            uid,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uid", &self.uid)
            .field("forward", &self.forward)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

// ============================================================================
// Start-up steps
// ============================================================================

/// Installs the configured agent package if the device does not have it.
async fn ensure_installed(config: &SessionConfig, bridge: &dyn DeviceBridge) -> Result<()> {
    let Some(apk) = &config.agent_apk else {
        return Ok(());
    };

    let installed = bridge
        .shell(&config.commands.installed_check())
        .await
        .map(|out| out.contains("package:"))
        .unwrap_or(false);

    if installed {
        debug!(package = %config.commands.package, "Agent already installed");
        return Ok(());
    }

    info!(apk = %apk.display(), "Installing agent");
    bridge.install(apk).await
}

/// Fails with `Startup` unless one of the probes reports the agent alive.
async fn probe_agent(config: &SessionConfig, bridge: &dyn DeviceBridge) -> Result<()> {
    for probe in [&config.commands.probe, &config.commands.probe_fallback] {
        match bridge.shell(probe).await {
            Ok(out) if !out.trim().is_empty() => {
                debug!(probe = %probe, "Agent is running");
                return Ok(());
            }
            Ok(_) => debug!(probe = %probe, "Probe found nothing"),
            // A probe tool missing from this shell; try the next one.
            Err(e) => debug!(probe = %probe, error = %e, "Probe failed"),
        }
    }

    Err(ClientError::Startup(format!(
        "{} is not running after launch",
        config.commands.package
    )))
}

/// Opens both connections, handshakes and starts the dispatcher.
async fn connect(config: &SessionConfig, addr: SocketAddr) -> Result<Connected> {
    let ids = Arc::new(AtomicU64::new(0));
    let transport = TcpTransport::open(addr, &config.connect).await?;
    let rpc = Arc::new(RpcClient::with_counter(Box::new(transport), Arc::clone(&ids)));

    let uid = match rpc.handshake(HandshakeRequest::initiate()).await {
        Ok(response) => response.uid,
        Err(e) => {
            close_quietly(&rpc).await;
            return Err(e);
        }
    };

    let event_rpc = match open_event_connection(config, addr, uid, ids).await {
        Ok(event_rpc) => event_rpc,
        Err(e) => {
            close_quietly(&rpc).await;
            return Err(e);
        }
    };

    let dispatcher = EventDispatcher::new(Arc::clone(&event_rpc), DispatcherConfig::from(config));
    if let Err(e) = dispatcher.start() {
        close_quietly(&event_rpc).await;
        close_quietly(&rpc).await;
        return Err(e);
    }

    Ok(Connected {
        rpc,
        event_rpc,
        dispatcher,
        uid,
    })
}

/// Attaches a second connection to session `uid` for event polling.
async fn open_event_connection(
    config: &SessionConfig,
    addr: SocketAddr,
    uid: i64,
    ids: Arc<AtomicU64>,
) -> Result<Arc<RpcClient>> {
    let transport = TcpTransport::open(addr, &config.connect).await?;
    let event_rpc = Arc::new(RpcClient::with_counter(Box::new(transport), ids));

    if let Err(e) = event_rpc.handshake(HandshakeRequest::resume(uid)).await {
        close_quietly(&event_rpc).await;
        return Err(e);
    }
    Ok(event_rpc)
}

async fn close_quietly(rpc: &RpcClient) {
    if let Err(e) = rpc.close().await {
        debug!(error = %e, "Failed to close connection during start-up cleanup");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LineTransport;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    /// Bridge that records every command it is asked to run.
    #[derive(Default)]
    struct RecordingBridge {
        shell: Mutex<Vec<String>>,
        removed: Mutex<Vec<u16>>,
        fail_shell: bool,
    }

    #[async_trait]
    impl DeviceBridge for RecordingBridge {
        async fn shell(&self, command: &str) -> Result<String> {
            self.shell.lock().unwrap().push(command.to_string());
            if self.fail_shell {
                return Err(ClientError::Bridge("device offline".to_string()));
            }
            Ok(String::new())
        }
        async fn forward(&self, _host_port: u16, _device_port: u16) -> Result<()> {
            Ok(())
        }
        async fn remove_forward(&self, host_port: u16) -> Result<()> {
            self.removed.lock().unwrap().push(host_port);
            Ok(())
        }
        async fn install(&self, _package: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Transport where every operation fails.
    struct BrokenTransport;

    #[async_trait]
    impl LineTransport for BrokenTransport {
        async fn send_line(&mut self, _line: &str) -> Result<()> {
            Err(ClientError::connection("socket reset"))
        }
        async fn receive_line(&mut self) -> Result<String> {
            Err(ClientError::connection("socket reset"))
        }
        async fn close(&mut self) -> Result<()> {
            Err(ClientError::connection("close failed"))
        }
    }

    fn broken_rpc() -> Arc<RpcClient> {
        Arc::new(RpcClient::new(Box::new(BrokenTransport)))
    }

    #[tokio::test]
    async fn test_close_attempts_every_step_when_transport_close_fails() {
        let bridge = Arc::new(RecordingBridge::default());
        let config = SessionConfig::default();
        let forward = PortForward::establish(bridge.clone(), Some(5555), 8080)
            .await
            .unwrap();

        let session = Session::from_parts(config.clone(), bridge.clone(), forward, broken_rpc(), broken_rpc(), 3);
        session.close().await;

        assert_eq!(*bridge.shell.lock().unwrap(), vec![config.commands.stop.clone()]);
        assert_eq!(*bridge.removed.lock().unwrap(), vec![5555]);
    }

    #[tokio::test]
    async fn test_close_removes_forward_when_stop_fails() {
        let bridge = Arc::new(RecordingBridge {
            fail_shell: true,
            ..Default::default()
        });
        let forward = PortForward::establish(bridge.clone(), Some(6000), 8080)
            .await
            .unwrap();

        let session = Session::from_parts(
            SessionConfig::default(),
            bridge.clone(),
            forward,
            broken_rpc(),
            broken_rpc(),
            1,
        );
        session.close().await;

        assert_eq!(*bridge.removed.lock().unwrap(), vec![6000]);
    }

    #[tokio::test]
    async fn test_probe_fails_when_both_probes_empty() {
        let bridge = RecordingBridge::default();
        let config = SessionConfig::default();

        let err = probe_agent(&config, &bridge).await.unwrap_err();
        assert!(matches!(err, ClientError::Startup(_)));
        assert_eq!(
            *bridge.shell.lock().unwrap(),
            vec![config.commands.probe.clone(), config.commands.probe_fallback.clone()]
        );
    }

    #[tokio::test]
    async fn test_no_install_without_apk() {
        let bridge = RecordingBridge::default();
        ensure_installed(&SessionConfig::default(), &bridge).await.unwrap();
        assert!(bridge.shell.lock().unwrap().is_empty());
    }
}
