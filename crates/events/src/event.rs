//! Notification envelope broadcast to real-time subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Room every subscriber is considered to be in.
pub const ROOM_ALL: &str = "all";

/// Delivery priority hint for subscribers.
///
/// The transport does not reorder by priority; consumers may.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope published on the shared channel.
///
/// Wire shape: `{type, data, room, priority, timestamp}`. The timestamp is an
/// ordering hint only; nothing guarantees ordering across publishers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub room: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Event for all rooms at normal priority.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            room: ROOM_ALL.to_string(),
            priority: Priority::Normal,
            timestamp,
        }
    }

    pub fn in_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether a connection joined to `room` should receive this event.
    pub fn targets(&self, room: &str) -> bool {
        self.room == ROOM_ALL || self.room == room
    }
}
