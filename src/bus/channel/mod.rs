//! In-memory channel backend for standalone mode.
//!
//! Each topic gets one bounded tokio mpsc buffer shared by the topic's writer
//! and reader. A full buffer makes writers wait (back-pressure) until a slot
//! frees, the context is cancelled, or the topic is closed.
//! Ideal for local development and testing without external dependencies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info};

use super::{
    reader_factory, writer_factory, Backend, BusError, Reader, Result, TopicSpec, Writer,
};
use crate::context::{CancelHandle, Context};
use crate::message::Message;

/// Per-topic buffer capacity.
pub const CHANNEL_CAPACITY: usize = 100;

/// One topic's buffer.
struct TopicBuffer {
    tx: mpsc::Sender<Message>,
    rx: AsyncMutex<mpsc::Receiver<Message>>,
    closer: CancelHandle,
    closed: Context,
}

impl TopicBuffer {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (closed, closer) = Context::with_cancel();
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            closer,
            closed,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn close(&self) {
        self.closer.cancel();
    }
}

/// In-process transport: a registry of per-topic buffers.
///
/// Writers and readers produced for the same topic share one buffer. Once a
/// topic is closed its buffer is discarded; the next handle requested for
/// that topic starts a fresh one.
pub struct ChannelBackend {
    capacity: usize,
    buffers: Mutex<HashMap<String, Arc<TopicBuffer>>>,
}

impl Default for ChannelBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBackend {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Buffers of a custom size. Capacity must be non-zero.
    pub fn with_capacity(capacity: usize) -> Self {
        info!(capacity, "Channel backend initialized");
        Self {
            capacity: capacity.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn buffer(&self, topic: &str) -> Arc<TopicBuffer> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        match buffers.get(topic) {
            Some(buffer) if !buffer.is_closed() => Arc::clone(buffer),
            _ => {
                debug!(topic = %topic, capacity = self.capacity, "Creating topic buffer");
                let buffer = Arc::new(TopicBuffer::new(self.capacity));
                buffers.insert(topic.to_string(), Arc::clone(&buffer));
                buffer
            }
        }
    }

    /// Messages currently buffered for `topic`.
    pub fn pending(&self, topic: &str) -> usize {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers
            .get(topic)
            .map(|b| b.tx.max_capacity() - b.tx.capacity())
            .unwrap_or(0)
    }

    /// Writer for `topic`, sharing the topic's buffer.
    pub fn writer(&self, topic: &str) -> ChannelWriter {
        ChannelWriter {
            topic: topic.to_string(),
            buffer: self.buffer(topic),
        }
    }

    /// Reader for `topic`, sharing the topic's buffer.
    pub fn reader(&self, topic: &str) -> ChannelReader {
        ChannelReader {
            topic: topic.to_string(),
            buffer: self.buffer(topic),
        }
    }

    /// Writer/reader factories over this backend's buffers.
    pub fn into_backend(self: Arc<Self>) -> Backend {
        let for_writers = Arc::clone(&self);
        let for_readers = self;
        Backend::new(
            "channel",
            writer_factory(move |spec: &TopicSpec<'_>| {
                Arc::new(for_writers.writer(spec.topic)) as Arc<dyn Writer>
            }),
            reader_factory(move |spec: &TopicSpec<'_>| {
                Arc::new(for_readers.reader(spec.topic)) as Arc<dyn Reader>
            }),
        )
    }
}

/// Sending half of a topic buffer.
pub struct ChannelWriter {
    topic: String,
    buffer: Arc<TopicBuffer>,
}

#[async_trait]
impl Writer for ChannelWriter {
    async fn write(&self, ctx: &Context, message: Message) -> Result<()> {
        if self.buffer.is_closed() {
            return Err(BusError::Closed);
        }

        // mpsc::Sender::send is cancel-safe: losing the race means the
        // message was not enqueued.
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(BusError::Canceled("publish")),
            _ = self.buffer.closed.cancelled() => Err(BusError::Closed),
            sent = self.buffer.tx.send(message) => {
                sent.map_err(|_| BusError::Closed)?;
                debug!(topic = %self.topic, "Message buffered");
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.buffer.close();
        Ok(())
    }
}

/// Receiving half of a topic buffer.
pub struct ChannelReader {
    topic: String,
    buffer: Arc<TopicBuffer>,
}

#[async_trait]
impl Reader for ChannelReader {
    async fn read_one(&self, ctx: &Context) -> Result<Message> {
        // Concurrent consumers of one topic take turns on the receiver.
        let mut rx = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(BusError::Canceled("read")),
            _ = self.buffer.closed.cancelled() => return Err(BusError::Closed),
            rx = self.buffer.rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(BusError::Canceled("read")),
            _ = self.buffer.closed.cancelled() => Err(BusError::Closed),
            msg = rx.recv() => msg.ok_or_else(|| BusError::Read {
                topic: self.topic.clone(),
                message: "buffer dropped".to_string(),
            }),
        }
    }

    async fn close(&self) -> Result<()> {
        self.buffer.close();
        Ok(())
    }
}
