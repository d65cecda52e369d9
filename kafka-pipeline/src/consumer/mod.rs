//! Group consumer: claims partitions, fans records into a bounded queue and drains them through
//! a fixed worker pool.
//!
//! Lifecycle is `Created -> Running -> Draining -> Closed`. [`KafkaConsumer::close`] drains in a
//! fixed order: the consume loop stops, the broker connection is released, the workers finish
//! everything still buffered, and only then is the queue closed.

pub mod claim;
pub mod group;
pub mod kafka_group;
pub mod queue;
pub mod session;
pub mod state;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{CommitPolicy, ConsumerSettings};
use crate::error::PipelineError;
use crate::handler::MessageHandler;
use crate::metrics_consts::CONSUME_ERRORS;

use self::claim::{ClaimReader, Dispatch};
use self::group::{Assignment, GroupClient};
use self::kafka_group::KafkaGroupClient;
use self::queue::DispatchQueue;
use self::session::{ConsumerSession, SessionCoordinator};
use self::state::{PipelineState, StateMachine};
use self::worker::WorkerPool;

const CONSUME_RETRY_BACKOFF: Duration = Duration::from_millis(100);

pub struct KafkaConsumer {
    settings: ConsumerSettings,
    client: Arc<dyn GroupClient>,
    handler: Arc<dyn MessageHandler>,
    queue: Arc<DispatchQueue<Dispatch>>,
    sessions: Arc<SessionCoordinator>,
    state: StateMachine,
    cancel: CancellationToken,
    closed: AtomicBool,
    running: tokio::sync::Mutex<Option<Running>>,
}

struct Running {
    consume_loop: JoinHandle<()>,
    workers: WorkerPool,
}

impl KafkaConsumer {
    /// Connects to the brokers and subscribes. Fails if the settings are invalid or the brokers
    /// can't be reached.
    pub fn new(
        settings: ConsumerSettings,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, PipelineError> {
        let client = KafkaGroupClient::new(&settings)?;
        Self::with_client(settings, handler, Arc::new(client))
    }

    pub fn with_client(
        settings: ConsumerSettings,
        handler: Arc<dyn MessageHandler>,
        client: Arc<dyn GroupClient>,
    ) -> Result<Self, PipelineError> {
        settings.validate()?;
        let queue = Arc::new(DispatchQueue::new(settings.queue_capacity()));

        Ok(Self {
            settings,
            client,
            handler,
            queue,
            sessions: Arc::new(SessionCoordinator::default()),
            state: StateMachine::default(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            running: tokio::sync::Mutex::new(None),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    pub fn current_session(&self) -> Option<Arc<ConsumerSession>> {
        self.sessions.current()
    }

    /// Number of messages buffered between the claim readers and the workers.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Waits until the current session has claimed its partitions.
    pub async fn wait_ready(&self) -> Arc<ConsumerSession> {
        self.sessions.wait_ready().await
    }

    /// Starts the workers and the consume loop, waits for the first session to become ready,
    /// then keeps waiting until [`close`](Self::close) is called.
    pub async fn start(&self) -> Result<(), PipelineError> {
        {
            let mut running = self.running.lock().await;
            self.state.transition(PipelineState::Running)?;

            let workers = WorkerPool::spawn(
                self.settings.num_workers,
                self.queue.clone(),
                self.handler.clone(),
            );
            let consume_loop = tokio::spawn(consume_loop(
                self.client.clone(),
                self.sessions.clone(),
                self.queue.clone(),
                self.settings.commit_policy,
                self.cancel.clone(),
            ));
            *running = Some(Running {
                consume_loop,
                workers,
            });
        }
        info!(
            group = %self.settings.group_id,
            topics = ?self.settings.topics,
            workers = self.settings.num_workers,
            "consumer started"
        );

        tokio::select! {
            _ = self.sessions.wait_ready() => {}
            _ = self.cancel.cancelled() => return Ok(()),
        }
        self.cancel.cancelled().await;
        Ok(())
    }

    /// Stops consuming and drains. Every message already in the queue is handled before this
    /// returns. Only the first call does anything; later calls return
    /// [`PipelineError::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), PipelineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyClosed);
        }

        // Never started: nothing to drain
        if self.state.transition(PipelineState::Closed).is_ok() {
            let released = self.client.close().await;
            self.queue.close().await;
            info!("consumer closed before start");
            return released.map_err(PipelineError::from);
        }

        self.state.transition(PipelineState::Draining)?;
        info!("consumer draining");
        self.cancel.cancel();

        let running = self.running.lock().await.take();
        let mut released = Ok(());
        if let Some(Running {
            consume_loop,
            workers,
        }) = running
        {
            if let Err(e) = consume_loop.await {
                error!("consume loop task failed: {}", e);
            }

            released = self.client.close().await;
            if let Err(e) = &released {
                error!("failed to close kafka client: {}", e);
            }

            workers.stop_and_join().await;
        }

        self.queue.close().await;
        self.state.transition(PipelineState::Closed)?;
        info!("consumer closed");
        released.map_err(PipelineError::from)
    }
}

/// Asks the group for assignments until cancelled, running one session per assignment.
async fn consume_loop(
    client: Arc<dyn GroupClient>,
    sessions: Arc<SessionCoordinator>,
    queue: Arc<DispatchQueue<Dispatch>>,
    commit_policy: CommitPolicy,
    cancel: CancellationToken,
) {
    loop {
        let assignment = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            assignment = client.next_assignment() => assignment,
        };

        match assignment {
            Ok(assignment) => {
                run_session(&client, &sessions, &queue, commit_policy, &cancel, assignment).await
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                metrics::counter!(CONSUME_ERRORS).increment(1);
                error!("error from consumer, retrying: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(CONSUME_RETRY_BACKOFF) => {}
                }
            }
        }
    }
    info!("consume loop stopped");
}

async fn run_session(
    client: &Arc<dyn GroupClient>,
    sessions: &SessionCoordinator,
    queue: &Arc<DispatchQueue<Dispatch>>,
    commit_policy: CommitPolicy,
    cancel: &CancellationToken,
    assignment: Assignment,
) {
    let session = sessions.begin_session(assignment.partitions(), cancel.child_token());
    let Assignment { claims, revoked } = assignment;

    let mut readers = JoinSet::new();
    for claim in claims {
        let reader = ClaimReader {
            client: client.clone(),
            queue: queue.clone(),
            session: session.clone(),
            commit_policy,
        };
        readers.spawn(reader.run(claim));
    }
    sessions.mark_ready(&session);

    tokio::select! {
        _ = revoked.cancelled() => info!(generation = session.generation(), "partitions revoked"),
        _ = session.done().cancelled() => {}
    }
    session.done().cancel();

    while let Some(result) = readers.join_next().await {
        if let Err(e) = result {
            error!("claim reader failed: {}", e);
        }
    }
}
