//! Inter-process message channel for Anvil worker processes
//!
//! This crate provides the ordered duplex channel between a parent build
//! process and a forked worker, plus the remote proxy registry that turns
//! local method calls into outbound messages and inbound messages into
//! handler dispatches.

pub mod channel;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use channel::{Channel, ChannelHandle, ChannelState, InboundConsumer};
pub use error::{BindingDirection, ChannelError};
pub use protocol::{ChannelMessage, InterfaceId, MessageEnvelope, CHANNEL_PROTOCOL_VERSION};
pub use registry::{Connection, DispatchError, InboundHandler, OutgoingProxy};
pub use transport::{JsonLineSink, JsonLineSource, MessageSink, MessageSource, Transport};
