//! Observability: Logging, Distributed Tracing and Metrics.

use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::version::BUILD_VERSION;

/// Initialize logging and, when an endpoint is configured, OTLP trace export.
///
/// `RUST_LOG` takes precedence over the configured log level.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let telemetry_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config()
                        .with_resource(opentelemetry_sdk::Resource::new(vec![
                            opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                        ])),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let (json_layer, pretty_layer) = if config.json_logging {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(telemetry_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;

    Ok(())
}

/// Shutdown OpenTelemetry, flushing pending spans.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Install the global Prometheus recorder.
///
/// The returned handle renders the text exposition served on `/debug/metrics`.
pub fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    record_build_info();
    Ok(handle)
}

/// Publish the running build as `build_info{version}`, always 1.
pub fn record_build_info() {
    gauge!("build_info", "version" => BUILD_VERSION).set(1.0);
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Counters
    describe_counter!("rate_limit_rejected_total", "Requests rejected by the per-client limiter");
    describe_counter!("auth_success_total", "Credentials resolved to a user");
    describe_counter!("auth_failures_total", "Credentials rejected, by reason");
    describe_counter!("http_errors_total", "Error responses, by error code");
    describe_counter!("http_panics_recovered_total", "Panics caught by the recovery layer");
    describe_counter!("background_tasks_failed_total", "Background tasks that failed or panicked");
    describe_counter!("shutdown_forced_total", "Shutdowns that missed the grace deadline");

    // Gauges
    describe_gauge!("rate_limiter_clients", "Clients tracked by the limiter after the last sweep");
    describe_gauge!("background_tasks_in_flight", "Background tasks currently running");
    describe_gauge!("db_pool_connections", "Open database connections, idle or in use");
    describe_gauge!("db_pool_idle", "Open database connections not checked out");
    describe_gauge!("build_info", "Build version of the running server");
}
