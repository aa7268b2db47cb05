//! Kafka backend.
//!
//! Topics map one-to-one onto Kafka topics. A single producer, created when
//! the backend is built, serves every writer; each reader owns a consumer in
//! the configured group, created when the topic is first consumed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers as _, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{
    reader_factory, writer_factory, Backend, BusError, Connection, Reader, Result, TopicSpec,
    Writer,
};
use crate::config::BusSettings;
use crate::context::{CancelHandle, Context};
use crate::message::{Headers, Message};

/// How long a publish may wait in the producer queue.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on flushing the producer at close.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Client settings derived from `BusSettings`.
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Bootstrap servers, comma separated.
    pub bootstrap_servers: String,
    /// Consumer group shared by every reader.
    pub group_id: String,
    /// Connect over TLS.
    pub tls: bool,
}

impl KafkaConfig {
    pub fn from_settings(settings: &BusSettings) -> Self {
        Self {
            bootstrap_servers: settings.kafka_broker_list().join(","),
            group_id: settings.kafka_group_id.clone(),
            tls: settings.kafka_enable_tls,
        }
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("message.timeout.ms", "5000");
        self.apply_security_config(&mut config);
        config
    }

    fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", &self.group_id);
        config.set("enable.auto.commit", "true");
        config.set("auto.offset.reset", "earliest");
        self.apply_security_config(&mut config);
        config
    }

    fn apply_security_config(&self, config: &mut ClientConfig) {
        if self.tls {
            config.set("security.protocol", "ssl");
        }
    }
}

/// Shared producer plus the consumer settings for readers.
pub struct KafkaBackend {
    config: KafkaConfig,
    producer: FutureProducer,
}

impl KafkaBackend {
    /// Create the producer. librdkafka connects lazily, so an unreachable
    /// cluster surfaces on the first publish; a malformed configuration
    /// fails here.
    pub fn connect(settings: &BusSettings) -> Result<Self> {
        let config = KafkaConfig::from_settings(settings);
        let producer: FutureProducer = config
            .producer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group_id = %config.group_id,
            "Connected to Kafka"
        );

        Ok(Self { config, producer })
    }

    pub fn into_backend(self) -> Backend {
        let producer = self.producer.clone();
        let config = self.config;

        Backend::new(
            "kafka",
            writer_factory(move |spec: &TopicSpec<'_>| {
                Arc::new(KafkaWriter {
                    producer: producer.clone(),
                    topic: spec.topic.to_string(),
                }) as Arc<dyn Writer>
            }),
            reader_factory(move |spec: &TopicSpec<'_>| {
                Arc::new(KafkaReader::new(config.consumer_config(), spec.topic)) as Arc<dyn Reader>
            }),
        )
        .with_connection(Arc::new(KafkaConnection {
            producer: self.producer,
        }))
    }
}

struct KafkaConnection {
    producer: FutureProducer,
}

#[async_trait]
impl Connection for KafkaConnection {
    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT))
            .await
            .map_err(|e| BusError::Connection(format!("Flush task failed: {}", e)))?
            .map_err(|e| BusError::Connection(format!("Failed to flush producer: {}", e)))?;
        info!("Kafka closed");
        Ok(())
    }
}

/// Produces to one topic.
pub struct KafkaWriter {
    producer: FutureProducer,
    topic: String,
}

#[async_trait]
impl Writer for KafkaWriter {
    async fn write(&self, ctx: &Context, message: Message) -> Result<()> {
        let record = FutureRecord::<(), [u8]>::to(&self.topic)
            .payload(&message.body)
            .headers(to_kafka_headers(&message.headers));

        let delivered = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(BusError::Canceled("publish")),
            delivered = self.producer.send(record, SEND_TIMEOUT) => delivered,
        };

        let (partition, offset) = delivered.map_err(|(e, _)| BusError::Write {
            topic: self.topic.clone(),
            message: format!("write message: {}", e),
        })?;

        debug!(topic = %self.topic, partition, offset, "Produced to Kafka");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The producer is shared; the broker's connection close flushes it.
        Ok(())
    }
}

/// Consumes one topic in the configured group.
pub struct KafkaReader {
    config: ClientConfig,
    topic: String,
    consumer: OnceCell<StreamConsumer>,
    closer: CancelHandle,
    closed: Context,
}

impl KafkaReader {
    fn new(config: ClientConfig, topic: &str) -> Self {
        let (closed, closer) = Context::with_cancel();
        Self {
            config,
            topic: topic.to_string(),
            consumer: OnceCell::new(),
            closer,
            closed,
        }
    }

    fn setup_err(&self, message: String) -> BusError {
        BusError::Setup {
            topic: self.topic.clone(),
            message,
        }
    }

    fn read_err(&self, message: impl Into<String>) -> BusError {
        BusError::Read {
            topic: self.topic.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Reader for KafkaReader {
    async fn subscribe(&self, _ctx: &Context) -> Result<()> {
        self.consumer
            .get_or_try_init(|| async {
                let consumer: StreamConsumer = self
                    .config
                    .create()
                    .map_err(|e| self.setup_err(format!("create consumer: {}", e)))?;
                consumer
                    .subscribe(&[self.topic.as_str()])
                    .map_err(|e| self.setup_err(format!("subscribe: {}", e)))?;
                info!(topic = %self.topic, "Subscribed to Kafka topic");
                Ok::<_, BusError>(consumer)
            })
            .await?;
        Ok(())
    }

    async fn read_one(&self, ctx: &Context) -> Result<Message> {
        let consumer = self
            .consumer
            .get()
            .ok_or_else(|| self.read_err("consumer not started"))?;

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(BusError::Canceled("read")),
            _ = self.closed.cancelled() => Err(BusError::Closed),
            received = consumer.recv() => {
                let message = received.map_err(|e| self.read_err(e.to_string()))?;
                let body = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                let headers = message
                    .headers()
                    .map(from_kafka_headers)
                    .unwrap_or_default();
                Ok(Message::with_headers(body, headers))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closer.cancel();
        if let Some(consumer) = self.consumer.get() {
            consumer.unsubscribe();
        }
        Ok(())
    }
}

fn to_kafka_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (k, v)| {
            acc.insert(Header {
                key: k.as_str(),
                value: Some(v.as_str()),
            })
        })
}

/// UTF-8 headers with a value; anything else is dropped.
fn from_kafka_headers<H: rdkafka::message::Headers>(headers: &H) -> Headers {
    headers
        .iter()
        .filter_map(|header| {
            let value = std::str::from_utf8(header.value?).ok()?;
            Some((header.key.to_string(), value.to_string()))
        })
        .collect()
}
