//! Message types exchanged with the broker and with callers.

use crate::error::QueueError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Identifier of a delivery on a receiver link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(crate::error::ValidationError::Required {
                field: "message_id".to_string(),
            }
            .into());
        }
        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ============================================================================
// Wire Messages
// ============================================================================

/// AMQP message header; only the priority is used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Shard-local priority, 0-9
    pub priority: u8,
}

/// Body section of an AMQP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Binary data section; task identifiers travel as UTF-8 bytes here
    Data(Bytes),
    /// AMQP value section, as produced by foreign producers
    Value(String),
    Empty,
}

/// Message as sent to and received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpMessage {
    pub header: Header,
    pub body: MessageBody,
}

impl AmqpMessage {
    /// Create a data message with priority 0
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: Header::default(),
            body: MessageBody::Data(body.into()),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.header.priority = priority;
        self
    }

    pub fn priority(&self) -> u8 {
        self.header.priority
    }

    /// Raw bytes of a data body
    pub fn data(&self) -> Option<&Bytes> {
        match &self.body {
            MessageBody::Data(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// A message handed out by a receiver link, not yet settled
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: MessageId,
    pub message: AmqpMessage,
    /// Number of times the broker delivered this message before
    pub delivery_count: u32,
    pub received_at: Timestamp,
}

impl Delivery {
    /// Decode the task identifier carried by this delivery.
    pub fn decode_task_id(&self) -> Result<String, QueueError> {
        let malformed = |reason: &str| QueueError::MalformedMessage {
            message_id: self.delivery_id.to_string(),
            reason: reason.to_string(),
        };

        let bytes = self
            .message
            .data()
            .ok_or_else(|| malformed("body is not a binary data section"))?;

        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| malformed("body is not valid UTF-8"))
    }
}

// ============================================================================
// Caller Items
// ============================================================================

/// A task reference to push, with its priority in `0..=max_priority`.
///
/// The target partition is given to the push call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushItem {
    pub task_id: Bytes,
    pub priority: u32,
}

impl PushItem {
    pub fn new(task_id: impl Into<Bytes>, priority: u32) -> Self {
        Self {
            task_id: task_id.into(),
            priority,
        }
    }
}
