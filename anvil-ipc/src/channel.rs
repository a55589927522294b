//! Ordered duplex message channel
//!
//! A channel owns one connected transport and two pump tasks: a writer task
//! draining a bounded outbound queue in FIFO order, and a reader task
//! delivering inbound frames to the single registered consumer in receive
//! order. Ordering holds per direction; there is no cross-direction
//! guarantee.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::ChannelError;
use crate::protocol::{ChannelMessage, MessageEnvelope};
use crate::transport::{MessageSink, MessageSource, Transport};

/// Size of the outbound queue; senders block here under transport backpressure
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Consumer of inbound channel traffic
///
/// Registered once when the channel is opened and invoked on the channel's
/// delivery task. `disconnected` runs exactly once if the transport dies
/// before an orderly close.
pub trait InboundConsumer: Send + Sync + 'static {
    fn deliver(&self, message: ChannelMessage);
    fn disconnected(&self, reason: &ChannelError);
}

/// Channel lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
    Broken,
}

enum Outbound {
    Message(MessageEnvelope),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug)]
struct ChannelShared {
    state: Mutex<ChannelState>,
    broken_reason: Mutex<Option<String>>,
    disconnect_notified: AtomicBool,
    close_started: AtomicBool,
}

impl ChannelShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState::Open),
            broken_reason: Mutex::new(None),
            disconnect_notified: AtomicBool::new(false),
            close_started: AtomicBool::new(false),
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    fn broken_error(&self) -> ChannelError {
        let reason = self
            .broken_reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "transport terminated unexpectedly".to_string());
        ChannelError::Broken(reason)
    }

    /// Transition to `Broken` unless an orderly shutdown is already underway,
    /// and notify the consumer at most once.
    fn mark_broken(&self, reason: String, consumer: &Arc<dyn InboundConsumer>) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ChannelState::Closing | ChannelState::Closed => return,
                ChannelState::Broken => {}
                ChannelState::Open => {
                    *state = ChannelState::Broken;
                    *self.broken_reason.lock().unwrap() = Some(reason.clone());
                }
            }
        }
        if !self.disconnect_notified.swap(true, Ordering::SeqCst) {
            consumer.disconnected(&ChannelError::Broken(reason));
        }
    }

    /// Peer announced end of stream; local sends now fail with `Closed`
    fn mark_peer_closed(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ChannelState::Open {
            *state = ChannelState::Closing;
        }
    }
}

/// Cloneable sending side of a channel, handed to outgoing proxies
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    outbound: mpsc::Sender<Outbound>,
    shared: Arc<ChannelShared>,
}

impl ChannelHandle {
    /// Current channel state
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Enqueue one message for delivery
    ///
    /// Returns once the message is queued; blocks only on outbound
    /// backpressure, never on the remote side processing it.
    pub async fn send(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Open => {}
            ChannelState::Closing | ChannelState::Closed => return Err(ChannelError::Closed),
            ChannelState::Broken => return Err(self.shared.broken_error()),
        }

        self.outbound
            .send(Outbound::Message(MessageEnvelope::new(message)))
            .await
            .map_err(|_| match self.state() {
                ChannelState::Broken => self.shared.broken_error(),
                _ => ChannelError::Closed,
            })
    }
}

/// An open channel over one transport
pub struct Channel {
    handle: ChannelHandle,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Open a channel over a connected transport, delivering inbound frames
    /// to `consumer`
    pub fn open(transport: Transport, consumer: Arc<dyn InboundConsumer>) -> Channel {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let shared = Arc::new(ChannelShared::new());

        let writer = tokio::spawn(write_loop(
            transport.sink,
            outbound_rx,
            shared.clone(),
            consumer.clone(),
        ));
        let reader = tokio::spawn(read_loop(transport.source, shared.clone(), consumer));

        Channel {
            handle: ChannelHandle { outbound, shared },
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Cloneable sending handle
    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ChannelState {
        self.handle.state()
    }

    /// Enqueue one message for delivery
    pub async fn send(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        self.handle.send(message).await
    }

    /// Orderly shutdown: flush pending outbound frames, announce end of
    /// stream to the peer, and release the transport sink. Idempotent.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.handle.shared.close_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.state() == ChannelState::Broken {
            return Err(self.handle.shared.broken_error());
        }

        {
            let mut state = self.handle.shared.state.lock().unwrap();
            if *state == ChannelState::Open || *state == ChannelState::Closing {
                *state = ChannelState::Closing;
            }
        }

        let outbound = &self.handle.outbound;
        let _ = outbound
            .send(Outbound::Message(MessageEnvelope::new(
                ChannelMessage::EndOfStream,
            )))
            .await;
        let (ack, flushed) = oneshot::channel();
        if outbound.send(Outbound::Flush(ack)).await.is_ok() {
            let _ = flushed.await;
        }
        let _ = outbound.send(Outbound::Shutdown).await;

        {
            let mut state = self.handle.shared.state.lock().unwrap();
            if *state != ChannelState::Broken {
                *state = ChannelState::Closed;
            }
        }

        let writer = self.writer.lock().unwrap().take();
        if let Some(task) = writer {
            let _ = task.await;
        }
        Ok(())
    }

    /// Wait for the delivery task to finish draining inbound frames
    pub async fn join(&self) {
        let reader = self.reader.lock().unwrap().take();
        if let Some(task) = reader {
            let _ = task.await;
        }
    }
}

async fn write_loop(
    mut sink: Box<dyn MessageSink>,
    mut outbound: mpsc::Receiver<Outbound>,
    shared: Arc<ChannelShared>,
    consumer: Arc<dyn InboundConsumer>,
) {
    while let Some(command) = outbound.recv().await {
        match command {
            Outbound::Message(envelope) => {
                if let Err(e) = sink.send(&envelope).await {
                    warn!("outbound write failed: {}", e);
                    shared.mark_broken(e.to_string(), &consumer);
                    // fail senders blocked on the queue
                    outbound.close();
                    break;
                }
            }
            Outbound::Flush(ack) => {
                let _ = ack.send(());
            }
            Outbound::Shutdown => break,
        }
    }

    if let Err(e) = sink.close().await {
        debug!("error releasing transport sink: {}", e);
    }
}

async fn read_loop(
    mut source: Box<dyn MessageSource>,
    shared: Arc<ChannelShared>,
    consumer: Arc<dyn InboundConsumer>,
) {
    loop {
        match source.receive().await {
            Ok(Some(envelope)) => match envelope.message {
                ChannelMessage::EndOfStream => {
                    debug!("peer closed the channel");
                    shared.mark_peer_closed();
                    break;
                }
                message => consumer.deliver(message),
            },
            Ok(None) => {
                shared.mark_broken("transport closed unexpectedly".to_string(), &consumer);
                break;
            }
            Err(e) => {
                shared.mark_broken(e.to_string(), &consumer);
                break;
            }
        }
    }
}
