//! Event dispatcher using the actor pattern.
//!
//! A background poll task long-polls the agent with `eventWait` and pushes
//! every event it receives into the queue actor. Consumers pop, wait on or
//! drain the per-name queues through an [`EventQueueHandle`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   eventWait   ┌─────────────────┐
//! │   Poll task     │──────────────▶│  Agent (device) │
//! └────────┬────────┘               └─────────────────┘
//!          │ Push
//!          ▼
//! ┌─────────────────┐  Pop/PopAll/  ┌─────────────────┐
//! │ EventQueueActor │◀──────────────│  Consumers      │
//! │ HashMap<name,   │  Clear (mpsc) │ (EventQueueHandle)
//! │   VecDeque>     │               └─────────────────┘
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - Poll errors are logged and retried, never propagated
//! - Channel operations handle closure gracefully

use std::sync::{Arc, Mutex};
use std::time::Duration;

use droidlink_protocol::{Event, EVENT_WAIT_METHOD};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{ClientError, Result};
use crate::rpc::RpcClient;

mod actor;
mod commands;
mod handle;

pub use actor::EventQueueActor;
pub use commands::{DispatcherState, PollOutcome, QueueCommand};
pub use handle::EventQueueHandle;

/// Channel buffer size for queue commands
const COMMAND_BUFFER: usize = 100;

/// Spawns a queue actor and returns a handle to it.
///
/// The actor runs until every handle is dropped.
pub fn spawn_event_queue() -> EventQueueHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    tokio::spawn(EventQueueActor::new(cmd_rx).run());
    EventQueueHandle::new(cmd_tx)
}

// ============================================================================
// Dispatcher Config
// ============================================================================

/// Poll loop timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Timeout passed to each `eventWait` call.
    pub poll_timeout: Duration,
    /// Pause after a failed poll before trying again.
    pub error_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(60),
            error_backoff: Duration::from_millis(500),
        }
    }
}

impl From<&SessionConfig> for DispatcherConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            poll_timeout: Duration::from_millis(config.event_poll_timeout_ms),
            error_backoff: config.poll_error_backoff(),
        }
    }
}

// ============================================================================
// Event Dispatcher
// ============================================================================

/// State shared between the dispatcher and its poll task.
struct Shared {
    rpc: Arc<RpcClient>,
    queue: EventQueueHandle,
    config: DispatcherConfig,
    state: watch::Sender<DispatcherState>,
    cancel_token: CancellationToken,
}

/// Surfaces agent events to local consumers.
///
/// `Created -> Running -> Canceled`. Canceling, explicitly or through the
/// shutdown sentinel, clears every queue; consumers still parked in `pop`
/// simply time out.
pub struct EventDispatcher {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// Creates a dispatcher polling through `rpc`.
    ///
    /// Spawns the queue actor, so it must be called inside a tokio runtime.
    /// Polling starts with [`EventDispatcher::start`].
    pub fn new(rpc: Arc<RpcClient>, config: DispatcherConfig) -> Self {
        let (state, _) = watch::channel(DispatcherState::Created);
        Self {
            shared: Arc::new(Shared {
                rpc,
                queue: spawn_event_queue(),
                config,
                state,
                cancel_token: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Handle for consuming events. Cheap to clone.
    pub fn events(&self) -> &EventQueueHandle {
        &self.shared.queue
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DispatcherState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the dispatcher reaches `Canceled`.
    pub async fn wait_until_canceled(&self) {
        let mut rx = self.shared.state.subscribe();
        // Err means the sender is gone, which only happens with the dispatcher.
        let _ = rx.wait_for(|state| *state == DispatcherState::Canceled).await;
    }

    /// Starts the poll task.
    ///
    /// # Errors
    ///
    /// `ClientError::Protocol` if the dispatcher was already started or canceled.
    pub fn start(&self) -> Result<()> {
        let started = self.shared.state.send_if_modified(|state| {
            if *state == DispatcherState::Created {
                *state = DispatcherState::Running;
                true
            } else {
                false
            }
        });

        if !started {
            return Err(ClientError::Protocol(format!(
                "event dispatcher cannot start from state {}",
                self.state()
            )));
        }

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move { shared.poll_loop().await });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }

        info!(
            poll_timeout_ms = self.shared.config.poll_timeout.as_millis() as u64,
            "Event dispatcher started"
        );
        Ok(())
    }

    /// Stops polling and clears every queue.
    ///
    /// Interrupts an in-flight `eventWait` and waits for the poll task to
    /// finish. Canceling twice is a no-op.
    pub async fn cancel(&self) {
        self.shared.cancel_token.cancel();

        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Event poll task ended abnormally");
            }
        }

        self.shared.mark_canceled().await;
    }

    /// Runs one poll result through the dispatcher.
    ///
    /// `result` is the non-null value returned by `eventWait`.
    pub async fn process_poll_result(&self, result: &Value) -> PollOutcome {
        self.shared.process_poll_result(result).await
    }
}

impl Drop for EventDispatcher {
    /// Stops the poll task, which would otherwise outlive its owner through
    /// its own reference to the shared state.
    fn drop(&mut self) {
        self.shared.cancel_token.cancel();
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Shared {
    async fn poll_loop(&self) {
        let timeout_ms = self.config.poll_timeout.as_millis() as u64;
        debug!(timeout_ms, "Event poll loop starting");

        loop {
            let result = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Event poll loop cancelled");
                    break;
                }
                result = self.rpc.call(EVENT_WAIT_METHOD, vec![json!(timeout_ms)]) => result,
            };

            match result {
                Ok(Some(value)) => match self.process_poll_result(&value).await {
                    PollOutcome::Queued(name) => trace!(event = %name, "Event queued"),
                    PollOutcome::Shutdown => break,
                    PollOutcome::Malformed(_) => {}
                    PollOutcome::QueueClosed => {
                        warn!("Event queue closed, stopping poll loop");
                        break;
                    }
                },
                Ok(None) => trace!("eventWait returned nothing"),
                Err(e) => {
                    warn!(error = %e, "Event poll failed, retrying");
                    tokio::select! {
                        _ = self.cancel_token.cancelled() => break,
                        _ = sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        debug!("Event poll loop stopped");
    }

    async fn process_poll_result(&self, result: &Value) -> PollOutcome {
        let event = match Event::from_value(result) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping malformed event");
                return PollOutcome::Malformed(e.to_string());
            }
        };

        if event.is_shutdown() {
            info!("Received dispatcher shutdown event");
            self.cancel_token.cancel();
            self.mark_canceled().await;
            return PollOutcome::Shutdown;
        }

        let name = event.name.clone();
        match self.queue.push(event).await {
            Ok(()) => PollOutcome::Queued(name),
            Err(_) => PollOutcome::QueueClosed,
        }
    }

    /// Moves to `Canceled` and clears all queues, once.
    async fn mark_canceled(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == DispatcherState::Canceled {
                false
            } else {
                *state = DispatcherState::Canceled;
                true
            }
        });

        if changed {
            if let Err(e) = self.queue.clear_all().await {
                debug!(error = %e, "Queue already closed while canceling");
            }
            info!("Event dispatcher canceled");
        }
    }
}
