//! Typed JSON messages on top of the byte-level broker.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::bus::{Broker, Result};
use crate::context::Context;

/// What a typed consumer does with a message that fails to decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodePolicy {
    /// Log the failure, drop the message and keep consuming.
    #[default]
    Skip,
    /// Log the failure and close the typed channel.
    Stop,
}

/// Serialize `value` as JSON and publish it. A serialization failure is
/// returned as `BusError::Marshal` and nothing is sent.
pub async fn publish_json<T: Serialize + ?Sized>(
    ctx: &Context,
    broker: &Broker,
    topic: &str,
    value: &T,
) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    broker.publish(ctx, topic, body).await
}

/// Consume `topic` and decode every body as `T`, skipping malformed ones.
pub async fn consume_json<T>(ctx: &Context, broker: &Broker, topic: &str) -> Result<mpsc::Receiver<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    consume_json_with_policy(ctx, broker, topic, DecodePolicy::default()).await
}

/// Like `consume_json`, with an explicit policy for undecodable bodies.
///
/// The typed channel closes when the underlying byte stream does, when
/// `ctx` is cancelled, or when the broker is closed.
pub async fn consume_json_with_policy<T>(
    ctx: &Context,
    broker: &Broker,
    topic: &str,
    policy: DecodePolicy,
) -> Result<mpsc::Receiver<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let mut raw = broker.consume(ctx, topic).await?;
    let (tx, rx) = mpsc::channel(1);
    let ctx = ctx.clone();
    let shutdown = broker.shutdown();
    let topic = topic.to_string();

    tokio::spawn(async move {
        'forward: loop {
            let permit = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                _ = shutdown.cancelled() => break,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let value = loop {
                let body = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => break 'forward,
                    _ = shutdown.cancelled() => break 'forward,
                    body = raw.recv() => match body {
                        Some(body) => body,
                        None => break 'forward,
                    },
                };

                match serde_json::from_slice::<T>(&body) {
                    Ok(value) => break value,
                    Err(e) => {
                        error!(topic = %topic, error = %e, "Failed to unmarshal message");
                        if policy == DecodePolicy::Stop {
                            warn!(topic = %topic, "Stopping typed consumer after decode failure");
                            break 'forward;
                        }
                    }
                }
            };

            permit.send(value);
        }
        debug!(topic = %topic, "Typed consumer ended");
    });

    Ok(rx)
}
