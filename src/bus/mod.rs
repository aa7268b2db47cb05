//! Topic/queue bus.
//!
//! This module contains:
//! - `Writer` / `Reader` traits: the backend adapter seam
//! - `WriterFactory` / `ReaderFactory`: per-topic handle construction, injected
//!   into the broker so the same publish/consume logic drives every transport
//! - `Broker`: topic registry, publish, consume and close
//! - Implementations: in-process channel, AMQP (RabbitMQ), Kafka, Mock

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BusSettings;
use crate::context::Context;
use crate::message::Message;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
mod broker;
pub mod channel;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod mock;
mod registry;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBackend;
pub use broker::{Broker, BrokerBuilder};
pub use channel::{ChannelBackend, CHANNEL_CAPACITY};
#[cfg(feature = "kafka")]
pub use kafka::KafkaBackend;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("{0} canceled")]
    Canceled(&'static str),

    #[error("Setup of '{topic}' failed: {message}")]
    Setup { topic: String, message: String },

    #[error("Write to '{topic}' failed: {message}")]
    Write { topic: String, message: String },

    #[error("Read from '{topic}' failed: {message}")]
    Read { topic: String, message: String },

    #[error("Marshal message failed: {0}")]
    Marshal(#[from] serde_json::Error),

    #[error("Bus closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// True when the operation stopped because its context was cancelled.
    pub fn is_canceled(&self) -> bool {
        matches!(self, BusError::Canceled(_))
    }
}

// ============================================================================
// Backend adapter
// ============================================================================

/// Sending half of a topic's backend handle.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Hand one message to the transport.
    ///
    /// May suspend (full buffer, network I/O); must give up with
    /// `BusError::Canceled` once `ctx` is cancelled.
    async fn write(&self, ctx: &Context, message: Message) -> Result<()>;

    /// Release the handle. Later writes fail.
    async fn close(&self) -> Result<()>;
}

/// Receiving half of a topic's backend handle.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Provision whatever the transport needs before the first read
    /// (queue declaration, topic subscription).
    async fn subscribe(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Block until one message arrives, the backend ends the stream, or `ctx`
    /// is cancelled.
    async fn read_one(&self, ctx: &Context) -> Result<Message>;

    /// Release the handle. Blocked and later reads fail.
    async fn close(&self) -> Result<()>;
}

/// Broker-wide connection owned by the `Broker`, closed last on shutdown.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// Everything a factory needs to build a handle for one topic.
#[derive(Debug, Clone, Copy)]
pub struct TopicSpec<'a> {
    /// Broker address list.
    pub brokers: &'a [String],
    /// Topic (or queue) name.
    pub topic: &'a str,
    /// Static broker settings.
    pub settings: &'a BusSettings,
}

/// Builds the writer for a topic. Connection failures belong to broker
/// construction, so factories never fail.
pub type WriterFactory = Arc<dyn Fn(&TopicSpec<'_>) -> Arc<dyn Writer> + Send + Sync>;

/// Builds the reader for a topic.
pub type ReaderFactory = Arc<dyn Fn(&TopicSpec<'_>) -> Arc<dyn Reader> + Send + Sync>;

/// Wrap a closure as a `WriterFactory`.
pub fn writer_factory<F>(f: F) -> WriterFactory
where
    F: Fn(&TopicSpec<'_>) -> Arc<dyn Writer> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a `ReaderFactory`.
pub fn reader_factory<F>(f: F) -> ReaderFactory
where
    F: Fn(&TopicSpec<'_>) -> Arc<dyn Reader> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A transport: writer/reader factories plus the optional shared connection.
#[derive(Clone)]
pub struct Backend {
    pub name: &'static str,
    pub writers: WriterFactory,
    pub readers: ReaderFactory,
    pub connection: Option<Arc<dyn Connection>>,
}

impl Backend {
    pub fn new(name: &'static str, writers: WriterFactory, readers: ReaderFactory) -> Self {
        Self {
            name,
            writers,
            readers,
            connection: None,
        }
    }

    pub fn with_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("connection", &self.connection.is_some())
            .finish()
    }
}
