use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::consumer::state::PipelineState;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("number of workers must be at least 1, got {0}")]
    InvalidWorkerCount(usize),
    #[error("at least one broker address is required")]
    EmptyBrokers,
    #[error("at least one topic is required")]
    EmptyTopics,
    #[error("consumer group id must not be empty")]
    EmptyGroupId,
    #[error("unknown commit policy: {0}")]
    UnknownCommitPolicy(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to reach kafka brokers: {0}")]
    BrokerUnreachable(#[source] KafkaError),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("cannot move pipeline from {from:?} to {to:?}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
    #[error("close was already called on this instance")]
    AlreadyClosed,
    #[error("pipeline is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer gone")]
    Gone,
}

/// Returned by the dispatch queue once it no longer admits messages.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("dispatch queue is closed")]
pub struct QueueClosed;
