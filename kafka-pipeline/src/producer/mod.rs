//! Fire-and-forget publishing.
//!
//! Callers push records onto a bounded input channel and return. A single driver task hands
//! them to the broker client; delivery outcomes come back on two result streams, each drained
//! by its own collector task.

pub mod collector;
pub mod context;
pub mod partitioner;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;
use opentelemetry_sdk::trace::TracerProvider;
use parking_lot::Mutex;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{BaseRecord, Producer, ThreadedProducer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use self::collector::{collect_errors, collect_successes, DeliveryObserver};
use self::context::DeliveryContext;
use self::partitioner::RoundRobinPartitioner;
use crate::config::KafkaConfig;
use crate::error::PipelineError;
use crate::message::{DeliveryOutcome, OutboundRecord};
use crate::propagation::{self, TraceHeaders};

const METADATA_TIMEOUT: Duration = Duration::from_secs(3);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);
const INPUT_BUFFER: usize = 256;

type BrokerClient = ThreadedProducer<DeliveryContext, RoundRobinPartitioner>;

pub struct KafkaProducer {
    input: Mutex<Option<mpsc::Sender<OutboundRecord>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    collectors: Mutex<Vec<JoinHandle<()>>>,
    tracer_provider: TracerProvider,
    closed: AtomicBool,
}

impl KafkaProducer {
    /// Connects to the brokers and starts the driver and both collectors. Must be called from
    /// within a tokio runtime.
    pub fn new(config: &KafkaConfig, tracer_provider: TracerProvider) -> Result<Self, PipelineError> {
        Self::with_observer(config, tracer_provider, None)
    }

    pub fn with_observer(
        config: &KafkaConfig,
        tracer_provider: TracerProvider,
        observer: Option<Arc<dyn DeliveryObserver>>,
    ) -> Result<Self, PipelineError> {
        if config.brokers().is_empty() {
            return Err(crate::error::ConfigError::EmptyBrokers.into());
        }
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.brokers().join(","))
            .set("statistics.interval.ms", "10000")
            .set("acks", "all")
            .set("compression.codec", "snappy")
            .set("linger.ms", "20")
            .set("message.timeout.ms", "20000");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka producer configuration: {:?}", client_config);
        let (success_tx, success_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let producer: BrokerClient =
            client_config.create_with_context(DeliveryContext::new(success_tx, error_tx))?;

        // Ping the cluster to make sure we can reach brokers
        drop(
            producer
                .client()
                .fetch_metadata(None, Timeout::After(METADATA_TIMEOUT))
                .map_err(PipelineError::BrokerUnreachable)?,
        );
        info!("connected to Kafka brokers");

        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        let driver = tokio::spawn(drive(producer, input_rx));
        let collectors = vec![
            tokio::spawn(collect_successes(success_rx, observer.clone())),
            tokio::spawn(collect_errors(error_rx, observer)),
        ];

        Ok(Self {
            input: Mutex::new(Some(input_tx)),
            driver: Mutex::new(Some(driver)),
            collectors: Mutex::new(collectors),
            tracer_provider,
            closed: AtomicBool::new(false),
        })
    }

    /// Queues a record without waiting for the broker. Outcomes are only logged.
    pub async fn publish(
        &self,
        topic: &str,
        key: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), PipelineError> {
        self.submit(OutboundRecord::new(topic, key, value)).await
    }

    /// Like [`publish`](Self::publish), but records a `produce:kafka:<topic>` span under `cx`
    /// and carries it in the record headers. The span ends once the record is queued.
    pub async fn publish_with_context(
        &self,
        cx: &Context,
        topic: &str,
        key: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), PipelineError> {
        let span_cx = propagation::start_produce_span(&self.tracer_provider, cx, topic);
        let record = OutboundRecord::new(topic, key, value)
            .with_trace_context(span_cx.span().span_context().clone());

        let submitted = self.submit(record).await;
        span_cx.span().end();
        submitted
    }

    async fn submit(&self, record: OutboundRecord) -> Result<(), PipelineError> {
        let input = self.input.lock().clone().ok_or(PipelineError::Closed)?;
        input.send(record).await.map_err(|_| PipelineError::Closed)
    }

    /// Stops accepting records, hands everything already queued to the broker client, flushes
    /// and releases it, then waits for both collectors to run out of outcomes. Later calls
    /// return [`PipelineError::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), PipelineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyClosed);
        }

        drop(self.input.lock().take());

        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                error!("producer driver task failed: {}", e);
            }
        }

        let collectors = std::mem::take(&mut *self.collectors.lock());
        for collector in collectors {
            if let Err(e) = collector.await {
                error!("delivery collector task failed: {}", e);
            }
        }
        info!("producer closed");
        Ok(())
    }
}

async fn drive(producer: BrokerClient, mut input: mpsc::Receiver<OutboundRecord>) {
    while let Some(record) = input.recv().await {
        send(&producer, record).await;
    }

    // Dropping the client drops the result senders it owns, which ends the collectors
    let released = tokio::task::spawn_blocking(move || {
        if let Err(e) = producer.flush(FLUSH_TIMEOUT) {
            error!("failed to flush kafka producer: {}", e);
        }
        drop(producer);
    })
    .await;
    if let Err(e) = released {
        error!("failed to release kafka producer: {}", e);
    }
}

async fn send(producer: &BrokerClient, record: OutboundRecord) {
    let topic = record.topic.clone();
    let key = record.key.clone();
    let value = record.value.clone();
    let timestamp = record.timestamp.timestamp_millis();

    let mut trace_headers = TraceHeaders::default();
    if record.trace_context.is_valid() {
        let cx = Context::new().with_remote_span_context(record.trace_context.clone());
        propagation::inject(&cx, &mut trace_headers);
    }

    let mut opaque = Box::new(record);
    loop {
        let mut base = BaseRecord::with_opaque_to(&topic, opaque)
            .key(key.as_str())
            .payload(value.as_slice())
            .timestamp(timestamp);
        if !trace_headers.is_empty() {
            base = base.headers(trace_headers.to_kafka_headers());
        }

        opaque = match producer.send(base) {
            Ok(()) => return,
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), base)) => {
                base.delivery_opaque
            }
            Err((cause, base)) => {
                producer.context().report(DeliveryOutcome::Failure {
                    record: *base.delivery_opaque,
                    partition: None,
                    offset: None,
                    cause,
                });
                return;
            }
        };
        // Local queue is full, give the client time to hand batches to the brokers
        tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
    }
}
