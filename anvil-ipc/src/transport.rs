//! Channel transport implementations

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::ChannelError;
use crate::protocol::{MessageEnvelope, CHANNEL_PROTOCOL_VERSION};

/// Writing half of a channel transport
#[async_trait]
pub trait MessageSink: Send {
    /// Write one envelope and flush it to the peer
    async fn send(&mut self, envelope: &MessageEnvelope) -> Result<(), ChannelError>;

    /// Release the underlying byte sink; the peer observes end of stream
    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Reading half of a channel transport
#[async_trait]
pub trait MessageSource: Send {
    /// Read the next envelope; `Ok(None)` signals end of stream
    async fn receive(&mut self) -> Result<Option<MessageEnvelope>, ChannelError>;
}

/// A connected duplex transport, split into halves so the channel can pump
/// both directions concurrently
pub struct Transport {
    pub sink: Box<dyn MessageSink>,
    pub source: Box<dyn MessageSource>,
}

impl Transport {
    pub fn new(sink: Box<dyn MessageSink>, source: Box<dyn MessageSource>) -> Self {
        Self { sink, source }
    }

    /// Transport over the current process's stdio, used by the worker side.
    /// Stdout belongs to the channel; workers must log to stderr.
    pub fn stdio() -> Self {
        Self::new(
            Box::new(JsonLineSink::new(tokio::io::stdout())),
            Box::new(JsonLineSource::new(tokio::io::stdin())),
        )
    }

    /// Transport over a spawned child's pipes, used by the parent side
    pub fn for_child(
        stdin: tokio::process::ChildStdin,
        stdout: tokio::process::ChildStdout,
    ) -> Self {
        Self::new(
            Box::new(JsonLineSink::new(stdin)),
            Box::new(JsonLineSource::new(stdout)),
        )
    }

    /// Connected in-memory transport pair, for tests and in-process workers
    pub fn in_memory_pair() -> (Self, Self) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            Self::new(
                Box::new(JsonLineSink::new(left_write)),
                Box::new(JsonLineSource::new(left_read)),
            ),
            Self::new(
                Box::new(JsonLineSink::new(right_write)),
                Box::new(JsonLineSource::new(right_read)),
            ),
        )
    }
}

/// Newline-delimited JSON writer over any async byte sink
pub struct JsonLineSink<W> {
    writer: W,
}

impl<W> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for JsonLineSink<W> {
    async fn send(&mut self, envelope: &MessageEnvelope) -> Result<(), ChannelError> {
        let mut line = serde_json::to_string(envelope)
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;
        line.push('\n');

        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ChannelError::Io(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| ChannelError::Io(e.to_string()))?;

        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| ChannelError::Io(e.to_string()))?;
        Ok(())
    }
}

/// Newline-delimited JSON reader over any async byte source
pub struct JsonLineSource<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead> JsonLineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageSource for JsonLineSource<R> {
    async fn receive(&mut self) -> Result<Option<MessageEnvelope>, ChannelError> {
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| ChannelError::Io(e.to_string()))?;

            if read == 0 {
                return Ok(None);
            }

            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let envelope: MessageEnvelope = serde_json::from_str(line)
                .map_err(|e| ChannelError::Deserialization(e.to_string()))?;

            if !envelope.is_compatible() {
                return Err(ChannelError::ProtocolVersionMismatch {
                    expected: CHANNEL_PROTOCOL_VERSION,
                    actual: envelope.protocol_version,
                });
            }

            return Ok(Some(envelope));
        }
    }
}
