//! Remote proxy registry: outgoing call-through proxies and incoming
//! dispatch bindings over one channel
//!
//! Outgoing bindings turn local method calls into fire-and-forget `Call`
//! frames; incoming bindings decode inbound frames and invoke a locally
//! supplied handler on the delivery task. At most one binding may exist per
//! (interface, direction) pair.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::{error, warn};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::channel::{Channel, ChannelHandle, InboundConsumer};
use crate::error::{BindingDirection, ChannelError};
use crate::protocol::{ChannelMessage, InterfaceId};
use crate::transport::Transport;

/// Handler for inbound calls addressed to one interface
///
/// `handle` runs synchronously on the channel's delivery task, in receive
/// order. A failing or panicking handler is isolated: the error is logged
/// and recorded, and delivery of subsequent messages continues.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(&self, method: &str, payload: JsonValue) -> anyhow::Result<()>;

    /// Transport died before an orderly close
    fn disconnected(&self) {}
}

/// A dispatch failure recorded while processing one inbound call
#[derive(Debug, Clone)]
pub struct DispatchError {
    pub interface: InterfaceId,
    pub method: String,
    pub message: String,
}

#[derive(Default)]
struct BindingTable {
    incoming: Mutex<HashMap<InterfaceId, Arc<dyn InboundHandler>>>,
    outgoing: Mutex<HashSet<InterfaceId>>,
    dispatch_errors: Mutex<Vec<DispatchError>>,
}

impl BindingTable {
    fn record_error(&self, interface: InterfaceId, method: String, message: String) {
        self.dispatch_errors.lock().unwrap().push(DispatchError {
            interface,
            method,
            message,
        });
    }
}

impl InboundConsumer for BindingTable {
    fn deliver(&self, message: ChannelMessage) {
        match message {
            ChannelMessage::Call {
                interface,
                method,
                payload,
            } => {
                let handler = self.incoming.lock().unwrap().get(&interface).cloned();
                let Some(handler) = handler else {
                    warn!("dropping call to unbound interface {}", interface);
                    let reason = ChannelError::UnboundInterface(interface.clone()).to_string();
                    self.record_error(interface, method, reason);
                    return;
                };

                match catch_unwind(AssertUnwindSafe(|| handler.handle(&method, payload))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("handler for {}.{} failed: {:#}", interface, method, e);
                        self.record_error(interface, method, format!("{:#}", e));
                    }
                    Err(_) => {
                        error!("handler for {}.{} panicked", interface, method);
                        self.record_error(interface, method, "handler panicked".to_string());
                    }
                }
            }
            ChannelMessage::Ready { worker_id, .. } => {
                warn!("unexpected ready frame from {} after handshake", worker_id);
            }
            // intercepted by the channel before dispatch
            ChannelMessage::EndOfStream => {}
        }
    }

    fn disconnected(&self, reason: &ChannelError) {
        warn!("channel disconnected: {}", reason);
        let handlers: Vec<_> = self.incoming.lock().unwrap().values().cloned().collect();
        for handler in handlers {
            handler.disconnected();
        }
    }
}

/// A channel plus its binding table
pub struct Connection {
    channel: Channel,
    bindings: Arc<BindingTable>,
}

impl Connection {
    /// Open a connection over a connected transport
    pub fn open(transport: Transport) -> Connection {
        let bindings = Arc::new(BindingTable::default());
        let channel = Channel::open(transport, bindings.clone());
        Connection { channel, bindings }
    }

    /// Register the handler invoked for inbound calls addressed to
    /// `interface`. At most one incoming binding may exist per interface.
    pub fn add_incoming(
        &self,
        interface: InterfaceId,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), ChannelError> {
        let mut incoming = self.bindings.incoming.lock().unwrap();
        if incoming.contains_key(&interface) {
            return Err(ChannelError::DuplicateBinding {
                interface,
                direction: BindingDirection::Incoming,
            });
        }
        incoming.insert(interface, handler);
        Ok(())
    }

    /// Produce the outgoing proxy for `interface`. At most one outgoing
    /// binding may exist per interface.
    pub fn add_outgoing(&self, interface: InterfaceId) -> Result<OutgoingProxy, ChannelError> {
        let mut outgoing = self.bindings.outgoing.lock().unwrap();
        if !outgoing.insert(interface.clone()) {
            return Err(ChannelError::DuplicateBinding {
                interface,
                direction: BindingDirection::Outgoing,
            });
        }
        Ok(OutgoingProxy {
            interface,
            channel: self.channel.handle(),
        })
    }

    /// The underlying channel
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Orderly shutdown of the underlying channel
    pub async fn close(&self) -> Result<(), ChannelError> {
        self.channel.close().await
    }

    /// Wait until inbound delivery has drained
    pub async fn join(&self) {
        self.channel.join().await;
    }

    /// Take the dispatch errors recorded so far
    pub fn drain_dispatch_errors(&self) -> Vec<DispatchError> {
        std::mem::take(&mut self.bindings.dispatch_errors.lock().unwrap())
    }
}

/// Local call-through proxy for one outgoing interface
///
/// Calls are fire-and-forget: `invoke` returns once the frame is queued and
/// never waits for the remote side to execute it.
#[derive(Debug)]
pub struct OutgoingProxy {
    interface: InterfaceId,
    channel: ChannelHandle,
}

impl OutgoingProxy {
    pub fn interface(&self) -> &InterfaceId {
        &self.interface
    }

    /// Encode one method invocation and enqueue it for delivery
    pub async fn invoke<T: Serialize>(&self, method: &str, args: &T) -> Result<(), ChannelError> {
        let payload =
            serde_json::to_value(args).map_err(|e| ChannelError::Serialization(e.to_string()))?;
        self.channel
            .send(ChannelMessage::Call {
                interface: self.interface.clone(),
                method: method.to_string(),
                payload,
            })
            .await
    }
}
