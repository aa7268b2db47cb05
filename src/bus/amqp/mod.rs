//! AMQP (RabbitMQ) backend.
//!
//! Each topic maps to a durable queue of the same name, published through the
//! default exchange. One connection and one channel serve every topic.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, ConnectionProperties, Consumer,
};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use super::{
    reader_factory, writer_factory, Backend, BusError, Connection, Reader, Result, TopicSpec,
    Writer,
};
use crate::config::BusSettings;
use crate::context::{CancelHandle, Context};
use crate::message::{Headers, Message};

const CONTENT_TYPE: &str = "application/octet-stream";

/// Connection plus channel, dialed once per broker.
pub struct AmqpBackend {
    connection: Arc<AmqpConnection>,
    auto_ack: bool,
}

impl AmqpBackend {
    /// Dial RabbitMQ and open the shared channel.
    pub async fn connect(settings: &BusSettings) -> Result<Self> {
        let url = settings.amqp_url();
        let connection = lapin::Connection::connect(&url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        info!(
            tls = settings.rabbitmq_enable_tls,
            auto_ack = settings.rabbitmq_auto_ack,
            "Connected to AMQP"
        );

        Ok(Self {
            connection: Arc::new(AmqpConnection {
                connection,
                channel,
            }),
            auto_ack: settings.rabbitmq_auto_ack,
        })
    }

    pub fn into_backend(self) -> Backend {
        let writer_channel = self.connection.channel.clone();
        let reader_channel = self.connection.channel.clone();
        let auto_ack = self.auto_ack;

        Backend::new(
            "amqp",
            writer_factory(move |spec: &TopicSpec<'_>| {
                Arc::new(AmqpWriter::new(writer_channel.clone(), spec.topic)) as Arc<dyn Writer>
            }),
            reader_factory(move |spec: &TopicSpec<'_>| {
                Arc::new(AmqpReader::new(reader_channel.clone(), spec.topic, auto_ack))
                    as Arc<dyn Reader>
            }),
        )
        .with_connection(self.connection)
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
    channel: Channel,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close channel: {}", e)))?;
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))?;
        info!("AMQP connection closed");
        Ok(())
    }
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Setup {
            topic: queue.to_string(),
            message: format!("declare queue: {}", e),
        })?;
    Ok(())
}

/// Publishes to one queue.
pub struct AmqpWriter {
    channel: Channel,
    queue: String,
    declared: OnceCell<()>,
}

impl AmqpWriter {
    fn new(channel: Channel, queue: &str) -> Self {
        Self {
            channel,
            queue: queue.to_string(),
            declared: OnceCell::new(),
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.declared
            .get_or_try_init(|| declare_queue(&self.channel, &self.queue))
            .await?;

        let mut properties = BasicProperties::default().with_content_type(CONTENT_TYPE.into());
        if !message.headers.is_empty() {
            properties = properties.with_headers(to_field_table(&message.headers));
        }

        let write_err = |e: lapin::Error| BusError::Write {
            topic: self.queue.clone(),
            message: format!("write message: {}", e),
        };

        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(write_err)?
            .await
            .map_err(write_err)?;

        debug!(queue = %self.queue, "Published to queue");
        Ok(())
    }
}

#[async_trait]
impl Writer for AmqpWriter {
    async fn write(&self, ctx: &Context, message: Message) -> Result<()> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(BusError::Canceled("publish")),
            sent = self.send(message) => sent,
        }
    }

    async fn close(&self) -> Result<()> {
        // The channel is shared; the broker's connection close releases it.
        Ok(())
    }
}

/// Consumes one queue.
pub struct AmqpReader {
    channel: Channel,
    queue: String,
    auto_ack: bool,
    consumer_tag: String,
    consumer: Mutex<Option<Consumer>>,
    closer: CancelHandle,
    closed: Context,
}

impl AmqpReader {
    fn new(channel: Channel, queue: &str, auto_ack: bool) -> Self {
        let (closed, closer) = Context::with_cancel();
        Self {
            channel,
            queue: queue.to_string(),
            auto_ack,
            consumer_tag: format!("courier-{}", uuid::Uuid::new_v4()),
            consumer: Mutex::new(None),
            closer,
            closed,
        }
    }

    fn read_err(&self, message: impl Into<String>) -> BusError {
        BusError::Read {
            topic: self.queue.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Reader for AmqpReader {
    async fn subscribe(&self, _ctx: &Context) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Ok(());
        }

        declare_queue(&self.channel, &self.queue).await?;

        let started = self
            .channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: self.auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Setup {
                topic: self.queue.clone(),
                message: format!("register consumer: {}", e),
            })?;

        info!(queue = %self.queue, tag = %self.consumer_tag, "AMQP consumer started");
        *consumer = Some(started);
        Ok(())
    }

    async fn read_one(&self, ctx: &Context) -> Result<Message> {
        let mut guard = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(BusError::Canceled("read")),
            _ = self.closed.cancelled() => return Err(BusError::Closed),
            guard = self.consumer.lock() => guard,
        };
        let consumer = guard
            .as_mut()
            .ok_or_else(|| self.read_err("consumer not started"))?;

        let delivery = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(BusError::Canceled("read")),
            _ = self.closed.cancelled() => return Err(BusError::Closed),
            next = consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(self.read_err(e.to_string())),
                None => return Err(self.read_err("consumer stream ended")),
            },
        };

        if !self.auto_ack {
            delivery
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| self.read_err(format!("ack: {}", e)))?;
        }

        let headers = from_field_table(delivery.properties.headers().as_ref());
        Ok(Message::with_headers(delivery.data, headers))
    }

    async fn close(&self) -> Result<()> {
        self.closer.cancel();
        if self.consumer.lock().await.take().is_some() {
            self.channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await
                .map_err(|e| BusError::Connection(format!("Failed to cancel consumer: {}", e)))?;
        }
        Ok(())
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let map: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(k, v)| (k.as_str().into(), AMQPValue::LongString(v.as_str().into())))
        .collect();
    FieldTable::from(map)
}

/// String-valued headers only; other AMQP value types are dropped.
fn from_field_table(table: Option<&FieldTable>) -> Headers {
    let Some(table) = table else {
        return Headers::new();
    };
    table
        .inner()
        .iter()
        .filter_map(|(k, v)| {
            let value = match v {
                AMQPValue::LongString(s) => String::from_utf8(s.as_bytes().to_vec()).ok()?,
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((k.as_str().to_string(), value))
        })
        .collect()
}
