//! Channel error types

use thiserror::Error;

use crate::protocol::InterfaceId;

/// Direction of a remote binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingDirection {
    Incoming,
    Outgoing,
}

impl std::fmt::Display for BindingDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingDirection::Incoming => f.write_str("incoming"),
            BindingDirection::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// Channel error types
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// IO error
    #[error("I/O error: {0}")]
    Io(String),

    /// Channel was closed by an orderly shutdown
    #[error("channel closed")]
    Closed,

    /// Transport terminated unexpectedly
    #[error("channel broken: {0}")]
    Broken(String),

    /// A binding for this (interface, direction) pair already exists
    #[error("duplicate {direction} binding for interface {interface}")]
    DuplicateBinding {
        interface: InterfaceId,
        direction: BindingDirection,
    },

    /// Protocol version mismatch
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// Inbound call addressed to an interface with no incoming binding
    #[error("no incoming binding for interface {0}")]
    UnboundInterface(InterfaceId),
}

impl ChannelError {
    /// Check if this error means the peer is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ChannelError::Closed | ChannelError::Broken(_))
    }

    /// Check if this error indicates a programmer-usage mistake rather than
    /// a runtime transport condition
    pub fn is_usage_error(&self) -> bool {
        matches!(self, ChannelError::DuplicateBinding { .. })
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            ChannelError::Io(err.to_string())
        } else if err.is_data() {
            ChannelError::Deserialization(err.to_string())
        } else {
            ChannelError::Serialization(err.to_string())
        }
    }
}
