use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::OwnedMessage;
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext, Message, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::group::{Assignment, GroupClient, PartitionClaim};
use crate::config::ConsumerSettings;
use crate::error::PipelineError;
use crate::message::Partition;
use crate::metrics_consts::CONSUME_ERRORS;

const METADATA_TIMEOUT: Duration = Duration::from_secs(3);
const CLAIM_BUFFER: usize = 16;
const CONSUME_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Routes fetched records to per-partition claim channels, which are created and dropped inside
/// the rebalance callbacks so that no record can arrive for a partition without a claim.
pub struct GroupContext {
    routes: Mutex<HashMap<Partition, mpsc::Sender<OwnedMessage>>>,
    revoked: Mutex<Option<CancellationToken>>,
    assignments: mpsc::UnboundedSender<Assignment>,
}

impl GroupContext {
    fn new(assignments: mpsc::UnboundedSender<Assignment>) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            revoked: Mutex::new(None),
            assignments,
        }
    }

    fn route(&self, partition: &Partition) -> Option<mpsc::Sender<OwnedMessage>> {
        self.routes.lock().get(partition).cloned()
    }

    fn assign(&self, partitions: &TopicPartitionList) {
        let mut claims = Vec::with_capacity(partitions.count());
        {
            let mut routes = self.routes.lock();
            for elem in partitions.elements() {
                let partition = Partition::from(elem);
                let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
                routes.insert(partition.clone(), tx);
                claims.push(PartitionClaim {
                    partition,
                    records: rx,
                });
            }
        }

        let revoked = CancellationToken::new();
        if let Some(previous) = self.revoked.lock().replace(revoked.clone()) {
            previous.cancel();
        }

        if self
            .assignments
            .send(Assignment { claims, revoked })
            .is_err()
        {
            warn!("assignment dropped, group client is shutting down");
        }
    }

    fn revoke(&self, partitions: &TopicPartitionList) {
        {
            let mut routes = self.routes.lock();
            for elem in partitions.elements() {
                routes.remove(&Partition::from(elem));
            }
        }
        if let Some(revoked) = self.revoked.lock().take() {
            revoked.cancel();
        }
    }

    fn release_all(&self) {
        self.routes.lock().clear();
        if let Some(revoked) = self.revoked.lock().take() {
            revoked.cancel();
        }
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!("revoking {} partitions", partitions.count());
                self.revoke(partitions);
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!("rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            info!("assigned {} partitions", partitions.count());
            self.assign(partitions);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("committed offsets for {} partitions", offsets.count()),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!("failed to commit offsets: {}", e),
        }
    }
}

/// Broker-backed [`GroupClient`]. Offsets are stored locally and flushed by librdkafka's
/// auto-commit.
pub struct KafkaGroupClient {
    consumer: Arc<StreamConsumer<GroupContext>>,
    assignments: tokio::sync::Mutex<mpsc::UnboundedReceiver<Assignment>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl KafkaGroupClient {
    pub fn new(settings: &ConsumerSettings) -> Result<Self, PipelineError> {
        settings.validate()?;

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", settings.brokers.join(","))
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                settings.auto_commit_interval_ms.to_string(),
            )
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &settings.offset_reset)
            .set("session.timeout.ms", "10000");

        if settings.tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer: StreamConsumer<GroupContext> =
            client_config.create_with_context(GroupContext::new(tx))?;

        // Ping the cluster to make sure we can reach brokers
        drop(
            consumer
                .fetch_metadata(None, Timeout::After(METADATA_TIMEOUT))
                .map_err(PipelineError::BrokerUnreachable)?,
        );

        let topics: Vec<&str> = settings.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        info!(
            group = %settings.group_id,
            topics = ?settings.topics,
            "subscribed to kafka topics"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            assignments: tokio::sync::Mutex::new(rx),
            poll_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    fn ensure_polling(&self) {
        let mut task = self.poll_task.lock();
        if task.is_none() {
            *task = Some(tokio::spawn(poll_records(
                self.consumer.clone(),
                self.shutdown.clone(),
            )));
        }
    }
}

#[async_trait]
impl GroupClient for KafkaGroupClient {
    async fn next_assignment(&self) -> Result<Assignment, KafkaError> {
        if self.shutdown.is_cancelled() {
            return Err(KafkaError::Canceled);
        }
        self.ensure_polling();

        let mut assignments = self.assignments.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(KafkaError::Canceled),
            assignment = assignments.recv() => assignment.ok_or(KafkaError::Canceled),
        }
    }

    fn commit(&self, partition: &Partition, offset: i64) -> Result<(), KafkaError> {
        // librdkafka stores `offset + 1` itself
        self.consumer
            .store_offset(partition.topic(), partition.partition_number(), offset)
    }

    async fn close(&self) -> Result<(), KafkaError> {
        self.shutdown.cancel();
        let task = self.poll_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("kafka poll task failed: {}", e);
            }
        }
        self.consumer.context().release_all();

        // Flush whatever was stored since the last auto-commit before leaving the group
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || {
            let committed = match consumer.commit_consumer_state(CommitMode::Sync) {
                Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
                other => other,
            };
            consumer.unsubscribe();
            committed
        })
        .await
        .unwrap_or_else(|e| {
            error!("kafka consumer close task failed: {}", e);
            Ok(())
        })
    }
}

impl Drop for KafkaGroupClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn poll_records(consumer: Arc<StreamConsumer<GroupContext>>, shutdown: CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = consumer.recv() => received.map(|message| message.detach()),
        };

        match received {
            Ok(message) => {
                let partition = Partition::new(message.topic(), message.partition());
                let Some(route) = consumer.context().route(&partition) else {
                    warn!(%partition, "record for a partition without a claim, skipping");
                    continue;
                };
                // Waiting here holds back the fetch while the claim reader is behind
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    sent = route.send(message) => {
                        if sent.is_err() {
                            debug!(%partition, "claim released, dropping record");
                        }
                    }
                }
            }
            Err(e) => {
                metrics::counter!(CONSUME_ERRORS).increment(1);
                error!("error consuming from kafka, retrying: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(CONSUME_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!("kafka poll task stopped");
}
