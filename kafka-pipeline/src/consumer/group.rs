use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::Partition;

/// The consumer's view of group membership.
///
/// [`KafkaGroupClient`](super::kafka_group::KafkaGroupClient) is the broker-backed
/// implementation; tests substitute in-memory ones.
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Waits for the next partition assignment. An error is transient: the caller logs it and
    /// asks again.
    async fn next_assignment(&self) -> Result<Assignment, KafkaError>;

    /// Marks the record at `offset` on `partition` as consumed. Implementations commit the
    /// position of the next record to read, `offset + 1`, so a restart resumes right after it.
    fn commit(&self, partition: &Partition, offset: i64) -> Result<(), KafkaError>;

    /// Releases the broker connection. Claim streams end once this returns.
    async fn close(&self) -> Result<(), KafkaError>;
}

/// The partitions claimed for one session.
#[derive(Debug)]
pub struct Assignment {
    pub claims: Vec<PartitionClaim>,
    /// Cancelled when the group takes these partitions away.
    pub revoked: CancellationToken,
}

/// Exclusive read access to one partition for the lifetime of a session.
#[derive(Debug)]
pub struct PartitionClaim {
    pub partition: Partition,
    pub records: mpsc::Receiver<OwnedMessage>,
}

impl Assignment {
    /// The claimed partitions, in claim order.
    pub fn partitions(&self) -> Vec<Partition> {
        self.claims.iter().map(|c| c.partition.clone()).collect()
    }
}
