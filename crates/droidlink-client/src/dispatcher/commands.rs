//! Event queue commands and dispatcher state.
//!
//! This module defines the message types for communicating with the `EventQueueActor`:
//! - `QueueCommand`: Commands sent to the actor
//! - `DispatcherState`: Lifecycle of the polling task
//! - `PollOutcome`: What one poll step did with an `eventWait` result

use droidlink_protocol::Event;
use regex::Regex;
use tokio::sync::oneshot;

// ============================================================================
// Queue Commands
// ============================================================================

/// Commands sent to the event queue actor.
///
/// Queries carry a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking.
#[derive(Debug)]
pub enum QueueCommand {
    /// Append an event to the tail of its name's queue, or hand it to the
    /// oldest consumer parked on that name.
    Push {
        /// The event to deliver
        event: Event,
    },

    /// Take the head of a queue.
    ///
    /// Answered immediately when the queue is non-empty; otherwise the
    /// sender is parked until an event with this name is pushed.
    Pop {
        /// Event name to pop
        name: String,
        /// Channel receiving the event
        respond_to: oneshot::Sender<Event>,
    },

    /// Take the head of a queue without waiting.
    TryPop {
        /// Event name to pop
        name: String,
        /// Channel receiving the event, or `None` if the queue is empty
        respond_to: oneshot::Sender<Option<Event>>,
    },

    /// Drain one queue.
    PopAll {
        /// Event name to drain
        name: String,
        /// Channel receiving the drained events, oldest first
        respond_to: oneshot::Sender<Vec<Event>>,
    },

    /// Drain every queue whose name matches a pattern.
    PopMatching {
        /// Pattern tested against each queue name
        pattern: Regex,
        /// Channel receiving the drained events, ordered by event time
        respond_to: oneshot::Sender<Vec<Event>>,
    },

    /// Number of events queued under a name.
    QueueLen {
        /// Event name to count
        name: String,
        /// Channel receiving the count
        respond_to: oneshot::Sender<usize>,
    },

    /// Discard every event queued under a name.
    Clear {
        /// Event name to clear
        name: String,
    },

    /// Discard every queued event. Parked consumers stay parked.
    ClearAll,
}

// ============================================================================
// Dispatcher State
// ============================================================================

/// Lifecycle of an event dispatcher.
///
/// `Created -> Running -> Canceled`; `Canceled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Constructed, polling not started.
    Created,
    /// The poll task is running.
    Running,
    /// Stopped by request or by the shutdown sentinel.
    Canceled,
}

impl std::fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

// ============================================================================
// Poll Outcome
// ============================================================================

/// Result of feeding one `eventWait` result through the poll step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The event was queued under this name.
    Queued(String),
    /// The shutdown sentinel arrived; polling stops.
    Shutdown,
    /// The result was not a valid event and was dropped.
    Malformed(String),
    /// The queue actor is gone; nothing could be queued.
    QueueClosed,
}
