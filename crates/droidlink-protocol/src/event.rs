//! Event payloads delivered by the `eventWait` long-poll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Remote method that blocks until an event is available or the timeout elapses.
pub const EVENT_WAIT_METHOD: &str = "eventWait";

/// Reserved event name that stops the host's dispatcher instead of being queued.
pub const SHUTDOWN_EVENT: &str = "EventDispatcherShutdown";

/// Errors raised when an `eventWait` result is not a well-formed event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventParseError {
    #[error("event is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("event has no string \"name\" field")]
    MissingName,

    #[error("event \"time\" is not an integer: {0}")]
    InvalidTime(String),
}

/// A named, timestamped notification pushed by the agent.
///
/// `data` keeps the payload as JSON text; consumers decode it with
/// [`Event::data_value`] or their own types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub data: String,
    /// Agent clock, microseconds since the Unix epoch.
    pub time: i64,
}

impl Event {
    /// Creates an event from its parts.
    pub fn new(name: impl Into<String>, data: impl Into<String>, time: i64) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            time,
        }
    }

    /// Builds an event from the `result` of an `eventWait` call.
    ///
    /// A missing `data` becomes `"null"` and a missing `time` becomes 0.
    pub fn from_value(value: &Value) -> Result<Self, EventParseError> {
        let map = value
            .as_object()
            .ok_or_else(|| EventParseError::NotAnObject(value.to_string()))?;

        let name = map
            .get("name")
            .and_then(Value::as_str)
            .ok_or(EventParseError::MissingName)?;

        let data = map.get("data").map_or_else(|| "null".to_string(), Value::to_string);

        let time = match map.get("time") {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_i64()
                .ok_or_else(|| EventParseError::InvalidTime(v.to_string()))?,
        };

        Ok(Self::new(name, data, time))
    }

    /// Returns true for the dispatcher shutdown sentinel.
    pub fn is_shutdown(&self) -> bool {
        self.name == SHUTDOWN_EVENT
    }

    /// Decodes `data` back into a JSON value.
    pub fn data_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.data)
    }

    /// Converts `time` to a UTC timestamp, if it is in range.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.time)
    }
}
