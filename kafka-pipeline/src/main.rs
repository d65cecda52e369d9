use std::sync::Arc;

use anyhow::Context as _;
use envconfig::Envconfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use kafka_pipeline::config::{Config, ConsumerSettings};
use kafka_pipeline::telemetry::init_tracer_provider;
use kafka_pipeline::{
    handler_fn, propagation, HandlerError, InboundMessage, KafkaConsumer, KafkaProducer,
};

async fn shutdown() {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to register SIGTERM handler: {}", e);
            return;
        }
    };
    let mut interrupt = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
        Ok(interrupt) => interrupt,
        Err(e) => {
            error!("failed to register SIGINT handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };
    info!("shutdown signal received");
}

fn setup_metrics(config: &Config) -> anyhow::Result<()> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .with_http_listener(config.metrics_bind)
        .install()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("invalid configuration")?;

    let tracer_provider =
        init_tracer_provider(&config.telemetry).context("failed to build tracer provider")?;

    // Instantiate tracing outputs:
    //   - stdout with a level configured by the RUST_LOG envvar (default=INFO)
    //   - OpenTelemetry if enabled, for levels INFO and higher
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    let otel_layer = config
        .telemetry
        .otel_url
        .as_ref()
        .map(|_| OpenTelemetryLayer::new(tracer_provider.tracer("kafka-pipeline")))
        .with_filter(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();

    setup_metrics(&config).context("failed to install metrics exporter")?;

    let producer = Arc::new(
        KafkaProducer::new(&config.kafka, tracer_provider.clone())
            .context("failed to create kafka producer")?,
    );

    let relay_topic = config.relay_topic.clone();
    let relay = producer.clone();
    let relay_tracer = tracer_provider.clone();
    let handler = handler_fn(move |message: InboundMessage| {
        let relay_topic = relay_topic.clone();
        let relay = relay.clone();
        let relay_tracer = relay_tracer.clone();
        async move {
            info!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                trace_id = %message.trace_id(),
                "handling message"
            );
            if let Some(topic) = relay_topic {
                let cx = propagation::start_consume_span(&relay_tracer, &message);
                let relayed = relay
                    .publish_with_context(&cx, &topic, &message.key_str(), message.value.clone())
                    .await;
                cx.span().end();
                relayed.map_err(|e| HandlerError::Failed(e.into()))?;
            }
            Ok(())
        }
    });

    let settings = ConsumerSettings::from_config(&config.kafka, &config.consumer)?;
    let consumer = Arc::new(
        KafkaConsumer::new(settings, Arc::new(handler)).context("failed to create kafka consumer")?,
    );

    let mut runner = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.start().await }
    });

    let stopped = tokio::select! {
        _ = shutdown() => None,
        stopped = &mut runner => Some(stopped),
    };

    consumer.close().await.context("failed to close consumer")?;
    let stopped = match stopped {
        Some(stopped) => stopped,
        None => runner.await,
    };
    match stopped {
        Ok(Err(e)) => error!("consumer stopped with error: {}", e),
        Err(e) => error!("consumer task failed: {}", e),
        Ok(Ok(())) => {}
    }
    producer.close().await.context("failed to close producer")?;

    for result in tracer_provider.force_flush() {
        if let Err(e) = result {
            error!("failed to flush spans: {}", e);
        }
    }
    info!("shutdown complete");
    Ok(())
}
