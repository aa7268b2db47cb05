//! Shared publish/consume contract for live-broker tests.
//!
//! Each backend test file starts a broker container, builds a `Broker`
//! against it and runs these checks. Topic names are unique per run so
//! queues left over from earlier checks do not interfere.

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use courier::{Broker, Context};

/// How long a live broker gets to deliver a message.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

pub fn unique_topic(prefix: &str) -> String {
    format!("courier-test-{}-{}", prefix, uuid::Uuid::new_v4())
}

pub async fn recv(rx: &mut mpsc::Receiver<Bytes>) -> Option<Bytes> {
    tokio::time::timeout(DELIVERY_TIMEOUT, rx.recv())
        .await
        .expect("no delivery within timeout")
}

/// Consumer registered first receives a single published message.
pub async fn assert_round_trip(broker: &Broker) {
    let topic = unique_topic("roundtrip");
    let ctx = Context::background();

    let mut rx = broker.consume(&ctx, &topic).await.expect("consume");
    broker
        .publish(&ctx, &topic, "hello")
        .await
        .expect("publish");

    assert_eq!(recv(&mut rx).await.expect("message"), "hello");
}

/// Messages from one publisher arrive in publish order.
pub async fn assert_ordered_delivery(broker: &Broker) {
    let topic = unique_topic("ordered");
    let ctx = Context::background();
    let mut rx = broker.consume(&ctx, &topic).await.expect("consume");

    for i in 0..10 {
        broker
            .publish(&ctx, &topic, format!("m{}", i))
            .await
            .expect("publish");
    }
    for i in 0..10 {
        let body = recv(&mut rx).await.expect("message");
        assert_eq!(body, format!("m{}", i).as_bytes());
    }
}

/// Cancelling the consume context closes the channel.
pub async fn assert_cancel_closes_consumer(broker: &Broker) {
    let topic = unique_topic("cancel");
    let (ctx, handle) = Context::with_cancel();
    let mut rx = broker.consume(&ctx, &topic).await.expect("consume");

    handle.cancel();

    assert_eq!(recv(&mut rx).await, None);
}

/// Close ends consumers and rejects further publishes.
pub async fn assert_close(broker: &Broker) {
    let topic = unique_topic("close");
    let ctx = Context::background();
    let mut rx = broker.consume(&ctx, &topic).await.expect("consume");

    broker.close().await.expect("close");

    assert_eq!(recv(&mut rx).await, None);
    assert!(broker.publish(&ctx, &topic, "late").await.is_err());
}
