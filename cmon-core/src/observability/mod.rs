//! Observability infrastructure: tracing, metrics, health checks.

use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

pub mod health;
pub mod metrics;

/// Set CMON_OTLP_ENABLED=1 or OTEL_EXPORTER_OTLP_ENDPOINT to export spans.
fn otlp_enabled() -> bool {
    std::env::var("CMON_OTLP_ENABLED").is_ok()
        || std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
}

fn otlp_endpoint() -> String {
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string())
}

/// `RUST_LOG` wins; otherwise the configured level applies.
fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

/// Initialize logging, optional span export and the Prometheus exporter.
///
/// Must be called once at startup, from inside the tokio runtime.
pub fn init(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(&config.log_level))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true));

    if otlp_enabled() {
        let endpoint = otlp_endpoint();

        let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(&endpoint);

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                trace::config()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_id_generator(RandomIdGenerator::default())
                    .with_resource(Resource::new(vec![
                        opentelemetry::KeyValue::new("service.name", "cmond"),
                        opentelemetry::KeyValue::new(
                            "service.instance",
                            config.server_name.clone(),
                        ),
                        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ])),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
        subscriber.with(telemetry).init();
        tracing::info!(endpoint = %endpoint, "Observability initialized with OTLP tracing");
    } else {
        subscriber.init();
        tracing::info!("Observability initialized (set CMON_OTLP_ENABLED=1 for OTLP export)");
    }

    PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], config.metrics_port)).install()?;

    metrics::register_core_metrics();

    Ok(())
}

/// Flush pending spans.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
