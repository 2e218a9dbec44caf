// Structured logging, OTLP tracing and Prometheus metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::models::{DeliveryStatus, PushOutcome};

const SERVICE_NAME: &str = "courier";

/// Install the global subscriber: JSON logs filtered by `RUST_LOG` (falling
/// back to `log_level`), plus span export over OTLP when an endpoint is given
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Invalid log filter '{}': {}", log_level, e))?;

    let otel_layer = match tracing_endpoint {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(endpoint)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(env_filter),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );
    Ok(())
}

fn otlp_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build OTLP span exporter: {}", e))?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);
    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider.tracer(SERVICE_NAME))
}

/// Flush remaining spans; call on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Dispatch fan-outs are mostly in-process queue writes
const DISPATCH_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// Serve Prometheus metrics on `metrics_port` and describe the recorded series
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("courier_dispatch_duration_seconds".to_string()),
            DISPATCH_BUCKETS,
        )
        .map_err(|e| anyhow::anyhow!("Invalid histogram buckets: {}", e))?
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "courier_messages_total",
        "Dispatched messages by terminal delivery status"
    );
    describe_counter!("courier_push_total", "Connection pushes by outcome");
    describe_histogram!(
        "courier_dispatch_duration_seconds",
        "Duration of a dispatch fan-out in seconds"
    );
    describe_counter!("courier_plan_firings_total", "Plan trigger firings");
    describe_gauge!("courier_connections", "Currently registered connections");
    describe_counter!(
        "courier_scheduler_skew_total",
        "Scheduler ticks that arrived late"
    );

    tracing::info!(addr = %addr, "Prometheus exporter listening");
    Ok(())
}

#[inline]
pub fn record_message(status: DeliveryStatus) {
    counter!("courier_messages_total", "status" => status.as_str()).increment(1);
}

#[inline]
pub fn record_push(outcome: &PushOutcome) {
    counter!("courier_push_total", "outcome" => outcome.label()).increment(1);
}

#[inline]
pub fn record_dispatch_duration(provider_kind: &str, duration_seconds: f64) {
    histogram!(
        "courier_dispatch_duration_seconds",
        "provider_kind" => provider_kind.to_string()
    )
    .record(duration_seconds);
}

#[inline]
pub fn record_plan_firing(trigger: &'static str) {
    counter!("courier_plan_firings_total", "trigger" => trigger).increment(1);
}

#[inline]
pub fn update_connections(count: usize) {
    gauge!("courier_connections").set(count as f64);
}

#[inline]
pub fn record_scheduler_skew() {
    counter!("courier_scheduler_skew_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_single_shot() {
        let first = init_logging("info", None);
        let second = init_logging("debug", None);
        // A global subscriber can only be installed once per process
        assert!(first.is_err() || second.is_err());
    }

    #[test]
    fn test_metrics_recording_without_exporter() {
        record_message(DeliveryStatus::Sent);
        record_push(&PushOutcome::TransportError("timeout".to_string()));
        record_dispatch_duration("websocket", 0.002);
        record_plan_firing("repeat");
        update_connections(3);
        record_scheduler_skew();
    }
}
