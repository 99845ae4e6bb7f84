//! Event queue actor - owns the event queue table and processes commands.
//!
//! The EventQueueActor is the single owner of queued events. The poll task
//! pushes into it and consumers pop from it, all through one mpsc channel,
//! so the table needs no lock of its own.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply send failures mean the consumer gave up; they are handled, not logged as errors

use std::collections::{HashMap, VecDeque};

use droidlink_protocol::Event;
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use super::commands::QueueCommand;

/// The event queue actor.
///
/// # Ownership
///
/// The actor owns:
/// - `queues`: FIFO of undelivered events per event name
/// - `waiters`: consumers parked in `pop` per event name, oldest first
///
/// An event pushed while a consumer is parked on its name goes straight to
/// that consumer. A parked consumer whose receiver is gone (it timed out)
/// is skipped and the event moves on to the next one, or into the queue.
pub struct EventQueueActor {
    /// Command receiver
    receiver: mpsc::Receiver<QueueCommand>,

    /// Queued events by name
    queues: HashMap<String, VecDeque<Event>>,

    /// Parked consumers by name
    waiters: HashMap<String, VecDeque<oneshot::Sender<Event>>>,
}

impl EventQueueActor {
    /// Creates a new actor reading commands from `receiver`.
    pub fn new(receiver: mpsc::Receiver<QueueCommand>) -> Self {
        Self {
            receiver,
            queues: HashMap::new(),
            waiters: HashMap::new(),
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all handles dropped).
    pub async fn run(mut self) {
        debug!("Event queue actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        debug!(queued = self.total_queued(), "Event queue actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: QueueCommand) {
        match cmd {
            QueueCommand::Push { event } => self.handle_push(event),
            QueueCommand::Pop { name, respond_to } => self.handle_pop(name, respond_to),
            QueueCommand::TryPop { name, respond_to } => {
                let event = self.queues.get_mut(&name).and_then(VecDeque::pop_front);
                if let Err(Some(event)) = respond_to.send(event) {
                    self.queues.entry(name).or_default().push_front(event);
                }
            }
            QueueCommand::PopAll { name, respond_to } => {
                let events = self.handle_pop_all(&name);
                // Ignore send error - these events are lost with the caller
                let _ = respond_to.send(events);
            }
            QueueCommand::PopMatching {
                pattern,
                respond_to,
            } => {
                let events = self.handle_pop_matching(&pattern);
                let _ = respond_to.send(events);
            }
            QueueCommand::QueueLen { name, respond_to } => {
                let len = self.queues.get(&name).map_or(0, VecDeque::len);
                let _ = respond_to.send(len);
            }
            QueueCommand::Clear { name } => {
                if let Some(queue) = self.queues.remove(&name) {
                    debug!(event = %name, dropped = queue.len(), "Cleared event queue");
                }
            }
            QueueCommand::ClearAll => {
                let dropped = self.total_queued();
                self.queues.clear();
                info!(dropped, "Cleared all event queues");
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_push(&mut self, event: Event) {
        let mut event = event;

        if let Some(waiters) = self.waiters.get_mut(&event.name) {
            while let Some(waiter) = waiters.pop_front() {
                match waiter.send(event) {
                    Ok(()) => {
                        trace!("Delivered event to parked consumer");
                        return;
                    }
                    // Consumer timed out; try the next one.
                    Err(returned) => event = returned,
                }
            }
            self.waiters.remove(&event.name);
        }

        trace!(event = %event.name, time = event.time, "Queued event");
        self.queues
            .entry(event.name.clone())
            .or_default()
            .push_back(event);
    }

    fn handle_pop(&mut self, name: String, respond_to: oneshot::Sender<Event>) {
        if let Some(event) = self.queues.get_mut(&name).and_then(VecDeque::pop_front) {
            if let Err(event) = respond_to.send(event) {
                // Consumer already gone; keep the event at the head.
                self.queues.entry(name).or_default().push_front(event);
            }
            return;
        }

        if respond_to.is_closed() {
            return;
        }
        let waiters = self.waiters.entry(name).or_default();
        waiters.retain(|w| !w.is_closed());
        waiters.push_back(respond_to);
    }

    fn handle_pop_all(&mut self, name: &str) -> Vec<Event> {
        self.queues
            .remove(name)
            .map(Vec::from)
            .unwrap_or_default()
    }

    fn handle_pop_matching(&mut self, pattern: &Regex) -> Vec<Event> {
        let names: Vec<String> = self
            .queues
            .keys()
            .filter(|name| pattern.is_match(name))
            .cloned()
            .collect();

        let mut events: Vec<Event> = names
            .iter()
            .filter_map(|name| self.queues.remove(name))
            .flatten()
            .collect();

        // Stable: events with equal times keep their queue order.
        events.sort_by_key(|event| event.time);
        events
    }

    fn total_queued(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Returns the number of parked consumers for `name` (test helper).
    #[cfg(test)]
    pub fn waiter_count(&self, name: &str) -> usize {
        self.waiters.get(name).map_or(0, VecDeque::len)
    }
}
