//! Shared fixtures: an in-process fake agent and a recording device bridge.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use droidlink_client::{ClientError, ConnectPolicy, DeviceBridge, Result, SessionConfig};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// Session id the fake agent hands out.
pub const AGENT_UID: i64 = 7;

// ============================================================================
// Fake Agent
// ============================================================================

struct AgentState {
    refuse_handshake: bool,
    events: Mutex<mpsc::UnboundedReceiver<Value>>,
    handshakes: StdMutex<Vec<Value>>,
    requests: StdMutex<Vec<(u64, String)>>,
}

/// A loopback TCP server speaking the agent's line protocol.
///
/// Methods: `echo` returns its first parameter, `fail` reports `"boom"`,
/// `eventWait` returns the next event fed through [`FakeAgent::emit`] or
/// null after its timeout; anything else returns null.
pub struct FakeAgent {
    pub addr: SocketAddr,
    events: mpsc::UnboundedSender<Value>,
    state: Arc<AgentState>,
}

impl FakeAgent {
    pub async fn spawn() -> Self {
        Self::spawn_with(false).await
    }

    pub async fn spawn_refusing() -> Self {
        Self::spawn_with(true).await
    }

    async fn spawn_with(refuse_handshake: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake agent");
        let addr = listener.local_addr().expect("local addr");
        let (events, events_rx) = mpsc::unbounded_channel();

        let state = Arc::new(AgentState {
            refuse_handshake,
            events: Mutex::new(events_rx),
            handshakes: StdMutex::new(Vec::new()),
            requests: StdMutex::new(Vec::new()),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        Self { addr, events, state }
    }

    /// Queues an event for the next `eventWait`.
    pub fn emit(&self, name: &str, data: Value, time: i64) {
        self.events
            .send(json!({"name": name, "data": data, "time": time}))
            .expect("agent event channel");
    }

    pub fn handshakes(&self) -> Vec<Value> {
        self.state.handshakes.lock().unwrap().clone()
    }

    /// `(id, method)` for every ordinary request received, in order.
    pub fn requests(&self) -> Vec<(u64, String)> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Methods received, excluding the `eventWait` long-polls.
    pub fn calls(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|(_, method)| method)
            .filter(|method| method != "eventWait")
            .collect()
    }
}

async fn serve(stream: TcpStream, state: Arc<AgentState>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            break;
        };

        let reply = if request.get("cmd").is_some() {
            state.handshakes.lock().unwrap().push(request.clone());
            json!({"uid": AGENT_UID, "status": !state.refuse_handshake})
        } else {
            answer(&request, &state).await
        };

        let mut out = reply.to_string();
        out.push('\n');
        if writer.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn answer(request: &Value, state: &AgentState) -> Value {
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or_default().to_string();
    state
        .requests
        .lock()
        .unwrap()
        .push((id.as_u64().unwrap_or(0), method.clone()));

    match method.as_str() {
        "echo" => json!({"id": id, "result": request["params"][0], "error": null}),
        "fail" => json!({"id": id, "result": null, "error": "boom"}),
        "eventWait" => {
            let wait_ms = request["params"][0].as_u64().unwrap_or(0);
            let mut events = state.events.lock().await;
            match timeout(Duration::from_millis(wait_ms), events.recv()).await {
                Ok(Some(event)) => json!({"id": id, "result": event, "error": null}),
                _ => json!({"id": id, "result": null, "error": null}),
            }
        }
        _ => json!({"id": id, "result": null, "error": null}),
    }
}

// ============================================================================
// Fake Bridge
// ============================================================================

/// Device bridge that records commands instead of running `adb`.
#[derive(Default)]
pub struct FakeBridge {
    /// When false, both liveness probes print nothing.
    pub agent_alive: bool,
    pub shell: StdMutex<Vec<String>>,
    pub forwards: StdMutex<Vec<(u16, u16)>>,
    pub removed: StdMutex<Vec<u16>>,
    pub installed: StdMutex<Vec<String>>,
}

impl FakeBridge {
    pub fn alive() -> Arc<Self> {
        Arc::new(Self {
            agent_alive: true,
            ..Default::default()
        })
    }

    pub fn dead() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn shell_commands(&self) -> Vec<String> {
        self.shell.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceBridge for FakeBridge {
    async fn shell(&self, command: &str) -> Result<String> {
        self.shell.lock().unwrap().push(command.to_string());
        let probe = command.starts_with("pidof") || command.starts_with("ps");
        if probe && self.agent_alive {
            return Ok("4242\n".to_string());
        }
        Ok(String::new())
    }

    async fn forward(&self, host_port: u16, device_port: u16) -> Result<()> {
        self.forwards.lock().unwrap().push((host_port, device_port));
        Ok(())
    }

    async fn remove_forward(&self, host_port: u16) -> Result<()> {
        self.removed.lock().unwrap().push(host_port);
        Ok(())
    }

    async fn install(&self, package: &Path) -> Result<()> {
        if !package.exists() {
            return Err(ClientError::Bridge(format!("{} not found", package.display())));
        }
        self.installed
            .lock()
            .unwrap()
            .push(package.display().to_string());
        Ok(())
    }
}

// ============================================================================
// Config
// ============================================================================

/// Session config pointed at `agent`, with short timings.
pub fn test_config(agent: &FakeAgent) -> SessionConfig {
    SessionConfig {
        host_port: Some(agent.addr.port()),
        launch_settle_ms: 0,
        event_poll_timeout_ms: 100,
        poll_error_backoff_ms: 10,
        connect: quick_policy(),
        ..SessionConfig::default()
    }
}

pub fn quick_policy() -> ConnectPolicy {
    ConnectPolicy {
        initial_delay_ms: 5,
        max_delay_ms: 20,
        multiplier: 2.0,
        max_attempts: 3,
    }
}
