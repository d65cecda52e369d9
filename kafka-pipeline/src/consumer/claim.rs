use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use super::group::{GroupClient, PartitionClaim};
use super::queue::DispatchQueue;
use super::session::ConsumerSession;
use crate::config::CommitPolicy;
use crate::error::CommitError;
use crate::message::{InboundMessage, Partition};
use crate::metrics_consts::{OFFSET_COMMIT_ERRORS, RECORDS_RECEIVED};

/// Commits one record's offset. Holds the client weakly so a handle outliving the consumer
/// reports [`CommitError::Gone`] instead of keeping the connection alive.
#[derive(Clone)]
pub struct CommitHandle {
    client: Weak<dyn GroupClient>,
    partition: Partition,
    offset: i64,
}

impl CommitHandle {
    pub fn new(client: &Arc<dyn GroupClient>, partition: Partition, offset: i64) -> Self {
        Self {
            client: Arc::downgrade(client),
            partition,
            offset,
        }
    }

    pub fn commit(&self) -> Result<(), CommitError> {
        let client = self.client.upgrade().ok_or(CommitError::Gone)?;
        client.commit(&self.partition, self.offset)?;
        Ok(())
    }

    /// Commits, logging instead of failing. A lost commit only means the record may be read again.
    pub(crate) fn commit_or_log(&self) {
        if let Err(e) = self.commit() {
            metrics::counter!(OFFSET_COMMIT_ERRORS).increment(1);
            warn!(
                partition = %self.partition,
                offset = self.offset,
                error = %e,
                "failed to commit offset"
            );
        }
    }
}

/// What travels through the dispatch queue: the message, plus its commit handle when the
/// commit waits for the handler.
pub struct Dispatch {
    pub message: InboundMessage,
    pub commit: Option<CommitHandle>,
}

pub struct ClaimReader {
    pub client: Arc<dyn GroupClient>,
    pub queue: Arc<DispatchQueue<Dispatch>>,
    pub session: Arc<ConsumerSession>,
    pub commit_policy: CommitPolicy,
}

impl ClaimReader {
    /// Reads `claim` until the session ends or the claim stream closes. Records are handed to
    /// the queue in the order the partition delivered them.
    pub async fn run(self, mut claim: PartitionClaim) {
        let done = self.session.done().clone();

        loop {
            let record = tokio::select! {
                biased;
                _ = done.cancelled() => break,
                record = claim.records.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            let message = InboundMessage::from_kafka(&record);
            metrics::counter!(RECORDS_RECEIVED, "topic" => message.topic.clone()).increment(1);
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                key = %message.key_str(),
                value = %message.value_str(),
                trace_id = %message.trace_id(),
                "received kafka message"
            );

            let commit = CommitHandle::new(&self.client, message.partition_id(), message.offset);
            let dispatch = match self.commit_policy {
                CommitPolicy::OnDispatch => Dispatch {
                    message,
                    commit: None,
                },
                CommitPolicy::AfterHandle => Dispatch {
                    message,
                    commit: Some(commit.clone()),
                },
            };

            // May wait here while the workers catch up
            if self.queue.enqueue(dispatch).await.is_err() {
                warn!(partition = %claim.partition, "dispatch queue closed, stopping claim reader");
                break;
            }

            if self.commit_policy == CommitPolicy::OnDispatch {
                commit.commit_or_log();
            }
        }

        debug!(
            partition = %claim.partition,
            generation = self.session.generation(),
            "claim reader stopped"
        );
    }
}
