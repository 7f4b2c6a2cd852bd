//! Tracing setup: `RUST_LOG`-filtered console output, plus OTLP span export
//! when the standard `OTEL_EXPORTER_OTLP_*` environment is present.

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_semantic_conventions::SCHEMA_URL;
use opentelemetry_semantic_conventions::attribute::{
    DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION,
};
use std::env;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Describes this service to the telemetry backend.
fn resource(deployment_env: &str) -> Resource {
    Resource::builder()
        .with_service_name(env!("CARGO_PKG_NAME"))
        .with_schema_url(
            [
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, deployment_env.to_string()),
            ],
            SCHEMA_URL,
        )
        .build()
}

/// Handle to the registered telemetry stack. Dropping without calling
/// [`Telemetry::shutdown`] loses buffered spans.
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Registers the global subscriber. OTLP export turns on when
    /// `OTEL_EXPORTER_OTLP_ENDPOINT` is set; otherwise only the console
    /// layer is active.
    pub fn init(deployment_env: &str) -> Self {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,relay402=debug"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

        let otlp_enabled = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();
        if otlp_enabled {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .build()
                .expect("failed to build OTLP span exporter");
            let tracer_provider = SdkTracerProvider::builder()
                .with_resource(resource(deployment_env))
                .with_batch_exporter(exporter)
                .build();
            let tracer = tracer_provider.tracer(env!("CARGO_PKG_NAME"));
            global::set_tracer_provider(tracer_provider.clone());

            Registry::default()
                .with(env_filter)
                .with(fmt_layer)
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            Self {
                tracer_provider: Some(tracer_provider),
            }
        } else {
            Registry::default().with(env_filter).with(fmt_layer).init();
            Self {
                tracer_provider: None,
            }
        }
    }

    /// Flushes buffered spans. Called once on graceful shutdown.
    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider
            && let Err(e) = provider.shutdown()
        {
            eprintln!("telemetry shutdown failed: {e}");
        }
    }
}
