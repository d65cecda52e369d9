use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};

use crate::config::TelemetryConfig;

/// Builds the process tracer provider. Spans are exported over OTLP when `otel_url` is set and
/// only sampled locally otherwise. The caller owns the provider and shuts it down on exit.
pub fn init_tracer_provider(
    config: &TelemetryConfig,
) -> Result<TracerProvider, opentelemetry::trace::TraceError> {
    let trace_config = opentelemetry_sdk::trace::config()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            config.otel_sampling_rate,
        ))))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name(),
        )]));

    let mut builder = TracerProvider::builder().with_config(trace_config);
    if let Some(url) = &config.otel_url {
        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(url)
            .with_timeout(Duration::from_secs(3))
            .build_span_exporter()?;
        builder = builder.with_batch_exporter(exporter, runtime::Tokio);
    }
    Ok(builder.build())
}
