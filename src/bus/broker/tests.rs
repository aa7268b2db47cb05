use super::*;
use crate::bus::mock::{FailingWriter, RecordingWriter, ScriptedReader};
use crate::bus::{reader_factory, writer_factory, TopicSpec, Writer};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn settings() -> BusSettings {
    BusSettings {
        otel_enabled: false,
        ..Default::default()
    }
}

fn with_writer(writer: Arc<RecordingWriter>) -> Broker {
    Broker::builder(settings())
        .with_writer_factory(writer_factory(move |_spec: &TopicSpec<'_>| {
            Arc::clone(&writer) as Arc<dyn Writer>
        }))
        .build()
}

fn with_reader(reader: Arc<ScriptedReader>) -> Broker {
    Broker::builder(settings())
        .with_reader_factory(reader_factory(move |_spec: &TopicSpec<'_>| {
            Arc::clone(&reader) as Arc<dyn Reader>
        }))
        .build()
}

#[derive(Default)]
struct CountingConnection {
    closes: AtomicUsize,
}

#[async_trait]
impl Connection for CountingConnection {
    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn recv_within(rx: &mut mpsc::Receiver<Bytes>) -> Option<Bytes> {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("receiver did not resolve")
}

#[tokio::test]
async fn test_publish_hands_body_to_writer() {
    let writer = Arc::new(RecordingWriter::new());
    let broker = with_writer(Arc::clone(&writer));

    broker
        .publish(&Context::background(), "orders", "payload")
        .await
        .unwrap();

    let written = writer.written().await;
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].body, "payload");
    assert!(written[0].headers.is_empty(), "no trace headers with tracing off");
}

#[tokio::test]
async fn test_publish_with_cancelled_context_sends_nothing() {
    let writer = Arc::new(RecordingWriter::new());
    let broker = with_writer(Arc::clone(&writer));
    let (ctx, handle) = Context::with_cancel();
    handle.cancel();

    let result = broker.publish(&ctx, "orders", "payload").await;

    assert!(matches!(result, Err(BusError::Canceled("publish"))));
    assert_eq!(writer.written_count().await, 0);
}

#[tokio::test]
async fn test_publish_surfaces_backend_error() {
    let broker = Broker::builder(settings())
        .with_writer_factory(writer_factory(|_spec: &TopicSpec<'_>| {
            Arc::new(FailingWriter::new()) as Arc<dyn Writer>
        }))
        .build();

    let result = broker
        .publish(&Context::background(), "orders", "payload")
        .await;

    match result {
        Err(BusError::Write { message, .. }) => assert!(message.contains("connection reset")),
        other => panic!("expected write error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_publish_reuses_topic_writer() {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let broker = Broker::builder(settings())
        .with_writer_factory(writer_factory(move |_spec: &TopicSpec<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(RecordingWriter::new()) as Arc<dyn Writer>
        }))
        .build();
    let ctx = Context::background();

    for _ in 0..3 {
        broker.publish(&ctx, "orders", "x").await.unwrap();
    }

    assert_eq!(created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_consume_forwards_bodies_in_order_then_closes() {
    let reader = Arc::new(ScriptedReader::new(vec![
        Message::new("one"),
        Message::new("two"),
    ]));
    let broker = with_reader(reader);

    let mut rx = broker
        .consume(&Context::background(), "orders")
        .await
        .unwrap();

    assert_eq!(recv_within(&mut rx).await.unwrap(), "one");
    assert_eq!(recv_within(&mut rx).await.unwrap(), "two");
    // Script exhausted: the backend error ends the stream.
    assert!(recv_within(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_consume_setup_failure_is_returned() {
    let reader = Arc::new(ScriptedReader::empty().failing_subscribe());
    let broker = with_reader(reader);

    let result = broker.consume(&Context::background(), "orders").await;

    assert!(matches!(result, Err(BusError::Setup { .. })));
}

#[tokio::test]
async fn test_cancel_ends_consume_stream() {
    let (_feed, reader) = ScriptedReader::open();
    let broker = with_reader(Arc::new(reader));
    let (ctx, handle) = Context::with_cancel();

    let mut rx = broker.consume(&ctx, "orders").await.unwrap();
    handle.cancel();

    assert!(recv_within(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_dropped_receiver_stops_loop() {
    let (feed, reader) = ScriptedReader::open();
    let reader = Arc::new(reader);
    let broker = with_reader(Arc::clone(&reader));

    let rx = broker
        .consume(&Context::background(), "orders")
        .await
        .unwrap();
    drop(rx);

    // The loop reads this, then finds the receiver gone and exits.
    feed.send(Message::new("orphan")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Nobody else is reading, so the next message is still there.
    feed.send(Message::new("kept")).unwrap();
    let next = tokio::time::timeout(
        Duration::from_secs(1),
        reader.read_one(&Context::background()),
    )
    .await
    .expect("reader still held by the loop")
    .unwrap();
    assert_eq!(next.body, "kept");
}

#[tokio::test]
async fn test_close_ends_consumers_and_closes_handles_once() {
    let writer = Arc::new(RecordingWriter::new());
    let (_feed, reader) = ScriptedReader::open();
    let reader = Arc::new(reader);
    let connection = Arc::new(CountingConnection::default());

    let w = Arc::clone(&writer);
    let r = Arc::clone(&reader);
    let broker = Broker::builder(settings())
        .with_writer_factory(writer_factory(move |_spec: &TopicSpec<'_>| {
            Arc::clone(&w) as Arc<dyn Writer>
        }))
        .with_reader_factory(reader_factory(move |_spec: &TopicSpec<'_>| {
            Arc::clone(&r) as Arc<dyn Reader>
        }))
        .with_connection(connection.clone())
        .build();
    let ctx = Context::background();

    broker.publish(&ctx, "orders", "x").await.unwrap();
    let mut rx = broker.consume(&ctx, "orders").await.unwrap();

    broker.close().await.unwrap();
    broker.close().await.unwrap();

    assert!(recv_within(&mut rx).await.is_none());
    assert_eq!(writer.close_count(), 1);
    assert_eq!(reader.close_count(), 1);
    assert_eq!(connection.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_without_topics_is_ok() {
    let broker = Broker::channel(settings());
    assert!(broker.close().await.is_ok());
    assert!(broker.is_closed());
}

#[tokio::test]
async fn test_close_suppresses_handle_errors() {
    let broker = Broker::builder(settings())
        .with_writer_factory(writer_factory(|_spec: &TopicSpec<'_>| {
            Arc::new(FailingWriter::new()) as Arc<dyn Writer>
        }))
        .build();
    let _ = broker
        .publish(&Context::background(), "orders", "x")
        .await;

    assert!(broker.close().await.is_ok());
}

#[tokio::test]
async fn test_operations_after_close_fail() {
    let broker = Broker::channel(settings());
    broker.close().await.unwrap();
    let ctx = Context::background();

    assert!(matches!(
        broker.publish(&ctx, "orders", "x").await,
        Err(BusError::Closed)
    ));
    assert!(matches!(
        broker.consume(&ctx, "orders").await,
        Err(BusError::Closed)
    ));
}

#[tokio::test]
async fn test_close_leaves_registry_empty() {
    let broker = Broker::channel(settings());
    let ctx = Context::background();
    broker.publish(&ctx, "orders", "x").await.unwrap();

    broker.close().await.unwrap();
    let late = broker.registry.writer("orders").await;

    assert!(matches!(late, Err(BusError::Closed)));
    assert_eq!(broker.registry.topic_count().await, (0, 0));
}

#[tokio::test]
async fn test_builder_defaults_to_channel_transport() {
    let broker = Broker::builder(settings()).build();
    let ctx = Context::background();

    let mut rx = broker.consume(&ctx, "q").await.unwrap();
    broker.publish(&ctx, "q", "hello").await.unwrap();

    assert_eq!(recv_within(&mut rx).await.unwrap(), "hello");
    assert_eq!(broker.backend_name(), "channel");
}

#[tokio::test]
async fn test_builder_hands_brokers_to_factories() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let broker = Broker::builder(settings())
        .with_brokers(vec!["b1:9092".to_string(), "b2:9092".to_string()])
        .with_writer_factory(writer_factory(move |spec: &TopicSpec<'_>| {
            record.lock().unwrap().extend(spec.brokers.iter().cloned());
            Arc::new(RecordingWriter::new()) as Arc<dyn Writer>
        }))
        .build();

    broker
        .publish(&Context::background(), "orders", "x")
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["b1:9092", "b2:9092"]);
}

#[tokio::test]
async fn test_default_topic_follows_settings() {
    let broker = Broker::channel(BusSettings {
        kafka_topic: "events".to_string(),
        bus_backend: BackendType::Kafka,
        ..settings()
    });
    assert_eq!(broker.default_topic(), "events");
}

#[tokio::test]
async fn test_from_settings_builds_channel_broker() {
    let broker = Broker::from_settings(settings()).await.unwrap();
    assert_eq!(broker.backend_name(), "channel");
}

#[cfg(not(feature = "amqp"))]
#[tokio::test]
async fn test_from_settings_amqp_requires_feature() {
    let result = Broker::from_settings(BusSettings {
        bus_backend: BackendType::Amqp,
        ..settings()
    })
    .await;
    assert!(matches!(result, Err(BusError::Config(_))));
}

#[cfg(not(feature = "kafka"))]
#[tokio::test]
async fn test_from_settings_kafka_requires_feature() {
    let result = Broker::from_settings(BusSettings {
        bus_backend: BackendType::Kafka,
        ..settings()
    })
    .await;
    assert!(matches!(result, Err(BusError::Config(_))));
}

#[cfg(feature = "otel")]
mod traced {
    use super::*;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::layer::SubscriberExt;

    fn install() -> DefaultGuard {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));
        tracing::subscriber::set_default(subscriber)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_publish_injects_trace_headers() {
        let _guard = install();
        let writer = Arc::new(RecordingWriter::new());
        let w = Arc::clone(&writer);
        let broker = Broker::builder(BusSettings {
            otel_enabled: true,
            ..Default::default()
        })
        .with_writer_factory(writer_factory(move |_spec: &TopicSpec<'_>| {
            Arc::clone(&w) as Arc<dyn Writer>
        }))
        .build();

        broker
            .publish(&Context::background(), "orders", "x")
            .await
            .unwrap();

        let written = writer.written().await;
        assert!(written[0].header("traceparent").is_some());
    }
}
