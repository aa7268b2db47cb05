//! courier-roundtrip: publish one message and read it back.
//!
//! Smoke test for a bus deployment. Connects to the configured backend,
//! subscribes to the default topic, publishes a ping and waits for it.
//!
//! ## Configuration
//! - `--config <path>`: YAML settings file (see `BusSettings`)
//! - `COURIER_*`: environment overrides, e.g. `COURIER_BUS_BACKEND=kafka`
//! - `COURIER_LOG`: log filter (default `info`)
//! - `OTEL_SERVICE_NAME`: service name when `otel_enabled` is set

use std::time::Duration;

use tracing::{error, info};

use courier::utils::bootstrap;
use courier::{Broker, BusSettings, Context};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = bootstrap::parse_config_path();
    let settings = BusSettings::load(config_path.as_deref())?;

    #[cfg(feature = "otel")]
    let _otel_guard = if settings.otel_enabled {
        use courier::config::OTEL_SERVICE_NAME_ENV_VAR;

        let service_name = std::env::var(OTEL_SERVICE_NAME_ENV_VAR)
            .unwrap_or_else(|_| "courier-roundtrip".to_string());
        Some(courier::telemetry::init_otel(&service_name)?)
    } else {
        bootstrap::init_tracing();
        None
    };
    #[cfg(not(feature = "otel"))]
    bootstrap::init_tracing();

    let broker = Broker::from_settings(settings).await.map_err(|e| {
        error!(error = %e, "Failed to create broker");
        e
    })?;
    let topic = broker.default_topic().to_string();
    let ctx = Context::background();

    let mut rx = broker.consume(&ctx, &topic).await?;

    let ping = format!("ping {}", uuid::Uuid::new_v4());
    broker.publish(&ctx, &topic, ping.clone()).await?;

    let outcome = tokio::time::timeout(RECEIVE_TIMEOUT, async {
        while let Some(body) = rx.recv().await {
            if body == ping.as_bytes() {
                return Ok(());
            }
            // Shared queues may hold older traffic.
            info!(
                topic = %topic,
                received = %String::from_utf8_lossy(&body),
                "Skipping unrelated message"
            );
        }
        Err("consumer closed before the message arrived".to_string())
    })
    .await
    .unwrap_or_else(|_| Err(format!("no message within {:?}", RECEIVE_TIMEOUT)));

    if outcome.is_ok() {
        info!(topic = %topic, backend = broker.backend_name(), "Round trip succeeded");
    }

    broker.close().await?;
    outcome.map_err(Into::into)
}
