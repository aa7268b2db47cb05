//! Trace context propagation across the wire.
//!
//! Producers serialize the current span's W3C trace context into message
//! headers; consumers extract it and parent the per-message span on it, so a
//! consumer-side span joins the producer's trace. Without the `otel` feature
//! spans are still emitted through `tracing`, but headers stay empty.

use tracing::Span;

use crate::message::Headers;

/// Serialize the current span's trace context into a fresh header map.
#[cfg(feature = "otel")]
pub fn inject_headers() -> Headers {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let cx = Span::current().context();
    let mut headers = Headers::new();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut headers);
    });
    headers
}

#[cfg(not(feature = "otel"))]
pub fn inject_headers() -> Headers {
    Headers::new()
}

/// Span for one consumed message, parented on the context carried in its
/// headers when there is one.
pub fn consume_span(topic: &str, headers: &Headers) -> Span {
    let span = tracing::info_span!("bus.consume_message", topic = %topic);

    #[cfg(feature = "otel")]
    {
        use tracing_opentelemetry::OpenTelemetrySpanExt;

        if !headers.is_empty() {
            let parent_cx =
                opentelemetry::global::get_text_map_propagator(|propagator| {
                    propagator.extract(headers)
                });
            span.set_parent(parent_cx);
        }
    }
    #[cfg(not(feature = "otel"))]
    let _ = headers;

    span
}

/// Telemetry setup errors.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Tracer init failed: {0}")]
    TracerInit(String),
}

/// Shuts the tracer provider down (flushing pending spans) on drop.
#[cfg(feature = "otel")]
pub struct OtelGuard {
    provider: opentelemetry_sdk::trace::TracerProvider,
}

#[cfg(feature = "otel")]
impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("Error shutting down tracer provider: {:?}", e);
        }
    }
}

/// Install logging plus OTLP span export and the W3C propagator.
///
/// The exporter endpoint follows the standard `OTEL_EXPORTER_OTLP_ENDPOINT`
/// variable; the log filter comes from `COURIER_LOG`.
#[cfg(feature = "otel")]
pub fn init_otel(service_name: &str) -> Result<OtelGuard, TelemetryError> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use opentelemetry_sdk::{runtime, trace, Resource};
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = trace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(trace::Config::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .build();

    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
    opentelemetry::global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(service_name.to_string());
    tracing_subscriber::registry()
        .with(crate::utils::bootstrap::env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    tracing::info!(service = %service_name, "OpenTelemetry tracing initialized");

    Ok(OtelGuard { provider })
}
