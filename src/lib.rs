//! Courier - topic/queue publish-subscribe
//!
//! A broker-agnostic bus: applications publish byte payloads to named topics
//! and consume them as channels, over an in-process buffer, RabbitMQ or Kafka.
//! Trace context rides along in message headers.

pub mod bus;
pub mod codec;
pub mod config;
pub mod context;
pub mod message;
pub mod telemetry;
pub mod utils;

pub use bus::{Broker, BrokerBuilder, BusError};
pub use codec::{consume_json, consume_json_with_policy, publish_json, DecodePolicy};
pub use config::{BackendType, BusSettings};
pub use context::{CancelHandle, Context};
pub use message::{Headers, Message};
