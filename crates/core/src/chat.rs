//! Chat message model
//!
//! Chat history is append-only and persisted by the Room Service; live
//! messages arrive over the signaling channel.

use crate::timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One chat line in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message id assigned by the Room Service (absent for live messages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Sender user id
    pub sender_id: String,

    /// Sender e-mail, when the service resolved it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_email: Option<String>,

    /// Message text
    #[serde(rename = "message")]
    pub text: String,

    /// Time the relay accepted the message
    #[serde(with = "timestamp::lenient")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a message stamped now
    pub fn new(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: None,
            sender_id: sender_id.into(),
            sender_email: None,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
