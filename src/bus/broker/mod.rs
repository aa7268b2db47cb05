//! Broker: one publish/consume/close implementation over any backend.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, Instrument, Span};

use super::registry::TopicRegistry;
use super::{
    Backend, BusError, ChannelBackend, Connection, Reader, ReaderFactory, Result, WriterFactory,
};
use crate::config::{BackendType, BusSettings};
use crate::context::{CancelHandle, Context};
use crate::message::{Headers, Message};
use crate::telemetry;

/// Builder for `Broker`.
///
/// Factories default to a fresh in-process channel backend; tests swap in
/// doubles with `with_writer_factory` / `with_reader_factory`.
pub struct BrokerBuilder {
    settings: BusSettings,
    name: &'static str,
    brokers: Option<Vec<String>>,
    writers: Option<WriterFactory>,
    readers: Option<ReaderFactory>,
    connection: Option<Arc<dyn Connection>>,
}

impl BrokerBuilder {
    pub fn new(settings: BusSettings) -> Self {
        Self {
            settings,
            name: "channel",
            brokers: None,
            writers: None,
            readers: None,
            connection: None,
        }
    }

    /// Use a complete backend (factories plus connection).
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.name = backend.name;
        self.writers = Some(backend.writers);
        self.readers = Some(backend.readers);
        self.connection = backend.connection;
        self
    }

    pub fn with_writer_factory(mut self, factory: WriterFactory) -> Self {
        self.writers = Some(factory);
        self
    }

    pub fn with_reader_factory(mut self, factory: ReaderFactory) -> Self {
        self.readers = Some(factory);
        self
    }

    pub fn with_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Override the address list handed to factories (defaults to
    /// `BusSettings::broker_addresses`).
    pub fn with_brokers(mut self, brokers: Vec<String>) -> Self {
        self.brokers = Some(brokers);
        self
    }

    pub fn build(self) -> Broker {
        let (writers, readers) = match (self.writers, self.readers) {
            (Some(w), Some(r)) => (w, r),
            (w, r) => {
                let channel = Arc::new(ChannelBackend::new()).into_backend();
                (w.unwrap_or(channel.writers), r.unwrap_or(channel.readers))
            }
        };
        let backend = Backend::new(self.name, writers, readers);
        let brokers = self
            .brokers
            .unwrap_or_else(|| self.settings.broker_addresses());

        info!(
            backend = self.name,
            brokers = ?brokers,
            topic = %self.settings.default_topic(),
            otel_enabled = self.settings.otel_enabled,
            "Broker initialized"
        );

        let (shutdown, shutdown_handle) = Context::with_cancel();
        Broker {
            name: self.name,
            settings: self.settings.clone(),
            registry: TopicRegistry::new(backend, brokers, self.settings),
            connection: Mutex::new(self.connection),
            shutdown,
            shutdown_handle,
        }
    }
}

/// Topic-based publish/subscribe over a pluggable backend.
///
/// `publish`, `consume` and `close` may be called concurrently from any
/// number of tasks; share the broker through an `Arc`.
pub struct Broker {
    name: &'static str,
    settings: BusSettings,
    registry: TopicRegistry,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    shutdown: Context,
    shutdown_handle: CancelHandle,
}

impl Broker {
    pub fn builder(settings: BusSettings) -> BrokerBuilder {
        BrokerBuilder::new(settings)
    }

    /// Broker over in-process buffers.
    pub fn channel(settings: BusSettings) -> Self {
        let backend = Arc::new(ChannelBackend::new()).into_backend();
        BrokerBuilder::new(settings).with_backend(backend).build()
    }

    /// Broker over RabbitMQ. Dials eagerly; connection failure is returned.
    #[cfg(feature = "amqp")]
    pub async fn amqp(settings: BusSettings) -> Result<Self> {
        let backend = super::AmqpBackend::connect(&settings).await?.into_backend();
        Ok(BrokerBuilder::new(settings).with_backend(backend).build())
    }

    /// Broker over Kafka. Creates the producer eagerly.
    #[cfg(feature = "kafka")]
    pub async fn kafka(settings: BusSettings) -> Result<Self> {
        let backend = super::KafkaBackend::connect(&settings)?.into_backend();
        Ok(BrokerBuilder::new(settings).with_backend(backend).build())
    }

    /// Build the broker selected by `bus_backend`.
    ///
    /// Broker-backed variants require the corresponding feature:
    /// - AMQP: `--features amqp`
    /// - Kafka: `--features kafka`
    pub async fn from_settings(settings: BusSettings) -> Result<Self> {
        match settings.bus_backend {
            BackendType::Channel => Ok(Self::channel(settings)),
            BackendType::Amqp => {
                #[cfg(feature = "amqp")]
                {
                    Self::amqp(settings).await
                }

                #[cfg(not(feature = "amqp"))]
                {
                    Err(BusError::Config(
                        "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                            .to_string(),
                    ))
                }
            }
            BackendType::Kafka => {
                #[cfg(feature = "kafka")]
                {
                    Self::kafka(settings).await
                }

                #[cfg(not(feature = "kafka"))]
                {
                    Err(BusError::Config(
                        "Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                            .to_string(),
                    ))
                }
            }
        }
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    pub fn default_topic(&self) -> &str {
        self.settings.default_topic()
    }

    pub fn backend_name(&self) -> &'static str {
        self.name
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancelled once `close` starts. Forwarding tasks layered on top of
    /// `consume` watch this to stop with the broker.
    pub(crate) fn shutdown(&self) -> Context {
        self.shutdown.clone()
    }

    /// Send `body` to `topic`.
    ///
    /// Returns once the backend has accepted the message. With the channel
    /// backend this waits for buffer room (back-pressure) unless `ctx` is
    /// cancelled first. No retries are attempted.
    pub async fn publish(&self, ctx: &Context, topic: &str, body: impl Into<Bytes>) -> Result<()> {
        let body = body.into();
        if self.settings.otel_enabled {
            let span = tracing::info_span!("bus.publish", topic = %topic, backend = self.name);
            self.publish_inner(ctx, topic, body).instrument(span).await
        } else {
            self.publish_inner(ctx, topic, body).await
        }
    }

    async fn publish_inner(&self, ctx: &Context, topic: &str, body: Bytes) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(BusError::Canceled("publish"));
        }
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let writer = self.registry.writer(topic).await?;

        let headers = if self.settings.otel_enabled {
            telemetry::inject_headers()
        } else {
            Headers::new()
        };

        writer
            .write(ctx, Message::with_headers(body, headers))
            .await
            .inspect_err(|e| {
                if !e.is_canceled() {
                    error!(topic = %topic, error = %e, "Publish failed");
                }
            })?;

        info!(topic = %topic, "Message published");
        Ok(())
    }

    /// Start receiving `topic`.
    ///
    /// Returns immediately; a background task forwards message bodies in
    /// backend order. The receiver yields `None` once the stream has ended:
    /// `ctx` was cancelled, the backend failed, the broker was closed, or
    /// the receiver was dropped.
    pub async fn consume(&self, ctx: &Context, topic: &str) -> Result<mpsc::Receiver<Bytes>> {
        let span = if self.settings.otel_enabled {
            tracing::info_span!("bus.consume", topic = %topic, backend = self.name)
        } else {
            Span::none()
        };
        self.consume_inner(ctx, topic).instrument(span).await
    }

    async fn consume_inner(&self, ctx: &Context, topic: &str) -> Result<mpsc::Receiver<Bytes>> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let reader = self.registry.reader(topic).await?;
        reader.subscribe(ctx).await?;

        // Tokio channels need at least one slot; a single slot is the
        // closest thing to an unbuffered hand-off.
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(consume_loop(ConsumeLoop {
            topic: topic.to_string(),
            reader,
            ctx: ctx.clone(),
            shutdown: self.shutdown.clone(),
            out: tx,
            trace: self.settings.otel_enabled,
        }));

        info!(topic = %topic, "Consumer registered");
        Ok(rx)
    }

    /// Close every topic handle and the backend connection.
    ///
    /// Ends all consume loops. Close errors are logged, never returned, and
    /// calling this again is harmless.
    pub async fn close(&self) -> Result<()> {
        self.shutdown_handle.cancel();
        self.registry.close_all().await;

        if let Some(connection) = self.connection.lock().await.take() {
            if let Err(e) = connection.close().await {
                tracing::warn!(backend = self.name, error = %e, "Failed to close connection");
            }
        }

        info!(backend = self.name, "Broker closed");
        Ok(())
    }
}

struct ConsumeLoop {
    topic: String,
    reader: Arc<dyn Reader>,
    ctx: Context,
    shutdown: Context,
    out: mpsc::Sender<Bytes>,
    trace: bool,
}

/// Pull from the reader and forward bodies until cancellation, shutdown,
/// backend failure, or a dropped receiver. Dropping `out` on return closes
/// the caller's channel.
async fn consume_loop(state: ConsumeLoop) {
    let ConsumeLoop {
        topic,
        reader,
        ctx,
        shutdown,
        out,
        trace,
    } = state;

    let reason = loop {
        // Wait for the caller to take the previous body before pulling the
        // next one from the backend.
        let permit = tokio::select! {
            biased;
            _ = ctx.cancelled() => break "canceled",
            _ = shutdown.cancelled() => break "broker closed",
            permit = out.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break "receiver dropped",
            },
        };

        let message = tokio::select! {
            biased;
            _ = ctx.cancelled() => break "canceled",
            _ = shutdown.cancelled() => break "broker closed",
            read = reader.read_one(&ctx) => match read {
                Ok(message) => message,
                Err(e) if e.is_canceled() => break "canceled",
                Err(e) => {
                    debug!(topic = %topic, error = %e, "Read failed");
                    break "backend error";
                }
            },
        };

        if trace {
            telemetry::consume_span(&topic, &message.headers)
                .in_scope(|| debug!(topic = %topic, "Message received"));
        }

        permit.send(message.body);
    };

    debug!(topic = %topic, reason, "Consume loop ended");
}

#[cfg(test)]
mod tests;
