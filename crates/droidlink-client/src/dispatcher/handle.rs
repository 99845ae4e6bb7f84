//! Client interface for the event queue actor.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `ClientError::QueueClosed`

use std::time::Duration;

use droidlink_protocol::Event;
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use super::commands::QueueCommand;
use crate::error::{ClientError, Result};

/// Interval between re-checks in [`EventQueueHandle::pop_events`].
const POP_EVENTS_RECHECK: Duration = Duration::from_millis(50);

/// Handle for the event queue actor.
///
/// Cheap to clone and safe to share across tasks. Consumers may pop while
/// the poll task pushes.
#[derive(Clone)]
pub struct EventQueueHandle {
    sender: mpsc::Sender<QueueCommand>,
}

impl EventQueueHandle {
    pub fn new(sender: mpsc::Sender<QueueCommand>) -> Self {
        Self { sender }
    }

    /// Queues an event, or hands it to a consumer already waiting on its name.
    ///
    /// # Errors
    ///
    /// `ClientError::QueueClosed` if the actor has shut down.
    pub async fn push(&self, event: Event) -> Result<()> {
        self.sender
            .send(QueueCommand::Push { event })
            .await
            .map_err(|_| ClientError::QueueClosed)
    }

    /// Removes and returns the oldest event named `name`.
    ///
    /// Waits up to `wait` for one to arrive. Returns `Ok(None)` on timeout.
    /// A zero `wait` only checks what is already queued.
    pub async fn pop(&self, name: &str, wait: Duration) -> Result<Option<Event>> {
        let (tx, mut rx) = oneshot::channel();

        self.sender
            .send(QueueCommand::Pop {
                name: name.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| ClientError::QueueClosed)?;

        match timeout(wait, &mut rx).await {
            Ok(Ok(event)) => Ok(Some(event)),
            Ok(Err(_)) => Err(ClientError::QueueClosed),
            Err(_) => {
                // Closing first makes any later delivery bounce back into the
                // queue, where the follow-up try_pop finds it.
                rx.close();
                if let Ok(event) = rx.try_recv() {
                    return Ok(Some(event));
                }

                let event = self.try_pop(name).await?;
                if event.is_none() {
                    info!(
                        event = name,
                        timeout_ms = wait.as_millis() as u64,
                        "Timed out waiting for event"
                    );
                }
                Ok(event)
            }
        }
    }

    /// Removes and returns the oldest event named `name` without waiting.
    pub async fn try_pop(&self, name: &str) -> Result<Option<Event>> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(QueueCommand::TryPop {
                name: name.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| ClientError::QueueClosed)?;

        rx.await.map_err(|_| ClientError::QueueClosed)
    }

    /// Pops events named `name` until one satisfies `predicate`.
    ///
    /// Non-matching events are consumed and dropped. The `wait` budget
    /// covers the whole search, not each pop.
    pub async fn wait_for<F>(&self, name: &str, predicate: F, wait: Duration) -> Result<Option<Event>>
    where
        F: Fn(&Event) -> bool,
    {
        let deadline = Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(event) = self.pop(name, remaining).await? else {
                return Ok(None);
            };

            if predicate(&event) {
                return Ok(Some(event));
            }
            // Once the budget is spent, pop only drains what is already queued.
            debug!(event = name, time = event.time, "Dropped event not matching predicate");
        }
    }

    /// Drains every event currently queued under `name`, oldest first.
    pub async fn pop_all(&self, name: &str) -> Result<Vec<Event>> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(QueueCommand::PopAll {
                name: name.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| ClientError::QueueClosed)?;

        rx.await.map_err(|_| ClientError::QueueClosed)
    }

    /// Drains every queue whose name matches `pattern`, ordered by event time.
    ///
    /// Re-checks until something matches or `wait` runs out; returns an
    /// empty list on timeout.
    pub async fn pop_events(&self, pattern: &Regex, wait: Duration) -> Result<Vec<Event>> {
        let deadline = Instant::now() + wait;

        loop {
            let (tx, rx) = oneshot::channel();
            self.sender
                .send(QueueCommand::PopMatching {
                    pattern: pattern.clone(),
                    respond_to: tx,
                })
                .await
                .map_err(|_| ClientError::QueueClosed)?;

            let events = rx.await.map_err(|_| ClientError::QueueClosed)?;
            if !events.is_empty() {
                return Ok(events);
            }

            let now = Instant::now();
            if now >= deadline {
                info!(pattern = pattern.as_str(), "Timed out waiting for matching events");
                return Ok(events);
            }
            sleep(POP_EVENTS_RECHECK.min(deadline - now)).await;
        }
    }

    /// Number of events queued under `name`.
    pub async fn queue_len(&self, name: &str) -> Result<usize> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(QueueCommand::QueueLen {
                name: name.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| ClientError::QueueClosed)?;

        rx.await.map_err(|_| ClientError::QueueClosed)
    }

    /// Discards every event queued under `name`.
    pub async fn clear(&self, name: &str) -> Result<()> {
        self.sender
            .send(QueueCommand::Clear {
                name: name.to_string(),
            })
            .await
            .map_err(|_| ClientError::QueueClosed)
    }

    /// Discards every queued event.
    pub async fn clear_all(&self) -> Result<()> {
        self.sender
            .send(QueueCommand::ClearAll)
            .await
            .map_err(|_| ClientError::QueueClosed)
    }
}

impl std::fmt::Debug for EventQueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueueHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}
