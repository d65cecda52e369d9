#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::error::KafkaError;
use rdkafka::message::{OwnedMessage, Timestamp};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use kafka_pipeline::config::{CommitPolicy, ConsumerSettings};
use kafka_pipeline::consumer::group::{Assignment, GroupClient, PartitionClaim};
use kafka_pipeline::{HandlerError, InboundMessage, KafkaConsumer, MessageHandler, Partition};

pub const TOPIC: &str = "orders";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

pub async fn eventually(f: impl Fn() -> bool) {
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || std::future::ready(f())).await
}

pub fn settings(num_workers: usize, commit_policy: CommitPolicy) -> ConsumerSettings {
    ConsumerSettings::new(
        vec!["localhost:9092".to_string()],
        "test-group",
        vec![TOPIC.to_string()],
        num_workers,
    )
    .expect("valid settings")
    .with_commit_policy(commit_policy)
}

pub fn record(partition: i32, offset: i64, value: &str) -> OwnedMessage {
    OwnedMessage::new(
        Some(value.as_bytes().to_vec()),
        Some(format!("key-{offset}").into_bytes()),
        TOPIC.to_string(),
        Timestamp::NotAvailable,
        partition,
        offset,
        None,
    )
}

// ── Group client fake ───────────────────────────────────────────

/// In-memory group membership: tests push assignments and records, the consumer pulls them.
pub struct FakeGroupClient {
    assignments: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Assignment, KafkaError>>>,
    commits: Mutex<Vec<(Partition, i64)>>,
    positions: Mutex<HashMap<Partition, i64>>,
    close_calls: AtomicUsize,
}

pub struct GroupController {
    assignments: mpsc::UnboundedSender<Result<Assignment, KafkaError>>,
    client: Arc<FakeGroupClient>,
}

/// Test-side handle to one assignment.
pub struct FakeSession {
    pub claims: HashMap<i32, mpsc::Sender<OwnedMessage>>,
    pub revoked: CancellationToken,
}

impl FakeGroupClient {
    pub fn new() -> (Arc<FakeGroupClient>, GroupController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(FakeGroupClient {
            assignments: tokio::sync::Mutex::new(rx),
            commits: Mutex::new(Vec::new()),
            positions: Mutex::new(HashMap::new()),
            close_calls: AtomicUsize::new(0),
        });
        let controller = GroupController {
            assignments: tx,
            client: client.clone(),
        };
        (client, controller)
    }

    pub fn commits(&self) -> Vec<(Partition, i64)> {
        self.commits.lock().clone()
    }

    pub fn committed_offsets(&self) -> Vec<i64> {
        let mut offsets: Vec<i64> = self.commits.lock().iter().map(|(_, o)| *o).collect();
        offsets.sort_unstable();
        offsets
    }

    /// Where the group would resume reading `partition`, like the broker's committed offset.
    pub fn committed_position(&self, partition: i32) -> Option<i64> {
        self.positions
            .lock()
            .get(&Partition::new(TOPIC, partition))
            .copied()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GroupClient for FakeGroupClient {
    async fn next_assignment(&self) -> Result<Assignment, KafkaError> {
        let mut assignments = self.assignments.lock().await;
        match assignments.recv().await {
            Some(assignment) => assignment,
            None => std::future::pending().await,
        }
    }

    fn commit(&self, partition: &Partition, offset: i64) -> Result<(), KafkaError> {
        self.commits.lock().push((partition.clone(), offset));
        let mut positions = self.positions.lock();
        let position = positions.entry(partition.clone()).or_insert(0);
        *position = (*position).max(offset + 1);
        Ok(())
    }

    async fn close(&self) -> Result<(), KafkaError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl GroupController {
    pub fn assign(&self, partitions: &[i32]) -> FakeSession {
        let mut claims = Vec::new();
        let mut senders = HashMap::new();
        for &p in partitions {
            let (tx, rx) = mpsc::channel(64);
            senders.insert(p, tx);
            claims.push(PartitionClaim {
                partition: Partition::new(TOPIC, p),
                records: rx,
            });
        }
        let revoked = CancellationToken::new();
        self.assignments
            .send(Ok(Assignment {
                claims,
                revoked: revoked.clone(),
            }))
            .expect("consumer side is gone");
        FakeSession {
            claims: senders,
            revoked,
        }
    }

    pub fn fail(&self, error: KafkaError) {
        self.assignments
            .send(Err(error))
            .expect("consumer side is gone");
    }

    pub fn client(&self) -> Arc<FakeGroupClient> {
        self.client.clone()
    }
}

impl FakeSession {
    pub async fn send(&self, partition: i32, offset: i64, value: &str) {
        self.claims[&partition]
            .send(record(partition, offset, value))
            .await
            .expect("claim reader is gone");
    }

    /// Takes the partitions away, the way a rebalance would.
    pub fn revoke(self) {
        self.revoked.cancel();
    }
}

// ── Handler ─────────────────────────────────────────────────────

/// Records each handled value. Handling waits until the gate is opened.
pub struct RecordingHandler {
    gate: Arc<watch::Sender<bool>>,
    started: AtomicUsize,
    handled: Mutex<Vec<String>>,
    fail_on: Option<String>,
    panic_on: Option<String>,
}

pub struct Gate(Arc<watch::Sender<bool>>);

impl Gate {
    pub fn open(&self) {
        self.0.send_replace(true);
    }
}

impl RecordingHandler {
    pub fn open() -> Arc<RecordingHandler> {
        let (gate, handler) = Self::gated();
        gate.open();
        handler
    }

    pub fn gated() -> (Gate, Arc<RecordingHandler>) {
        Self::build(None, None)
    }

    pub fn failing_on(value: &str) -> Arc<RecordingHandler> {
        let (gate, handler) = Self::build(Some(value.to_string()), None);
        gate.open();
        handler
    }

    pub fn panicking_on(value: &str) -> Arc<RecordingHandler> {
        let (gate, handler) = Self::build(None, Some(value.to_string()));
        gate.open();
        handler
    }

    fn build(fail_on: Option<String>, panic_on: Option<String>) -> (Gate, Arc<RecordingHandler>) {
        let gate = Arc::new(watch::Sender::new(false));
        let handler = Arc::new(RecordingHandler {
            gate: gate.clone(),
            started: AtomicUsize::new(0),
            handled: Mutex::new(Vec::new()),
            fail_on,
            panic_on,
        });
        (Gate(gate), handler)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn handled(&self) -> Vec<String> {
        self.handled.lock().clone()
    }

    pub fn handled_sorted(&self) -> Vec<String> {
        let mut handled = self.handled();
        handled.sort();
        handled
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|e| HandlerError::Failed(e.into()))?;

        let value = message.value_str().to_string();
        if self.panic_on.as_deref() == Some(value.as_str()) {
            panic!("poisoned message {value}");
        }
        if self.fail_on.as_deref() == Some(value.as_str()) {
            return Err(HandlerError::Failed(anyhow::anyhow!("rejected {value}")));
        }
        self.handled.lock().push(value);
        Ok(())
    }
}

// ── Consumer harness ────────────────────────────────────────────

pub struct Harness {
    pub consumer: Arc<KafkaConsumer>,
    pub controller: GroupController,
    pub client: Arc<FakeGroupClient>,
    pub runner: tokio::task::JoinHandle<Result<(), kafka_pipeline::error::PipelineError>>,
}

impl Harness {
    pub fn start(settings: ConsumerSettings, handler: Arc<RecordingHandler>) -> Harness {
        let (client, controller) = FakeGroupClient::new();
        let consumer = Arc::new(
            KafkaConsumer::with_client(settings, handler, client.clone())
                .expect("failed to build consumer"),
        );
        let runner = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start().await }
        });
        Harness {
            consumer,
            controller,
            client,
            runner,
        }
    }

    pub async fn assign(&self, partitions: &[i32]) -> FakeSession {
        let session = self.controller.assign(partitions);
        tokio::time::timeout(WAIT_TIMEOUT, self.consumer.wait_ready())
            .await
            .expect("session never became ready");
        session
    }
}
