//! Channel protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Channel protocol version for compatibility checking
pub const CHANNEL_PROTOCOL_VERSION: u32 = 1;

/// Identity of a remotely bound interface.
///
/// Outgoing proxies and incoming handlers are registered per interface id;
/// the id travels inside every `Call` frame so the receiving side can route
/// the invocation to the matching dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceId(String);

impl InterfaceId {
    /// Create a new interface id
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Frames carried by a channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Worker-side handshake; the first frame a worker sends after connecting
    Ready { worker_id: String, pid: u32 },

    /// One method invocation addressed to a bound interface
    Call {
        interface: InterfaceId,
        method: String,
        payload: JsonValue,
    },

    /// Orderly end of stream; the sender emits nothing after this frame
    EndOfStream,
}

/// Message envelope for all channel communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: ChannelMessage,
}

impl MessageEnvelope {
    /// Create a new message envelope
    pub fn new(message: ChannelMessage) -> Self {
        Self {
            protocol_version: CHANNEL_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == CHANNEL_PROTOCOL_VERSION
    }
}
