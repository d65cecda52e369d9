use std::borrow::Cow;

use chrono::{DateTime, Utc};
use opentelemetry::trace::{SpanContext, TraceContextExt};
use opentelemetry::Context;
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::Message;

use crate::propagation;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// A record read from a claimed partition, handed to exactly one worker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
    pub trace_context: SpanContext,
}

impl InboundMessage {
    /// Copies the record out of the broker message and extracts its trace context from the headers.
    pub fn from_kafka<M: Message>(message: &M) -> Self {
        let trace_context = propagation::extract_from_message(message)
            .span()
            .span_context()
            .clone();

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
            value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
            trace_context,
        }
    }

    /// A context carrying the upstream span as a remote parent, for handlers that emit their own spans.
    pub fn context(&self) -> Context {
        if self.trace_context.is_valid() {
            Context::new().with_remote_span_context(self.trace_context.clone())
        } else {
            Context::new()
        }
    }

    pub fn partition_id(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }

    pub fn key_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }

    pub fn trace_id(&self) -> String {
        format_trace_id(&self.trace_context)
    }
}

/// A record submitted through the producer. Immutable once handed to the broker client.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub trace_context: SpanContext,
}

impl OutboundRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value: value.into(),
            timestamp: Utc::now(),
            trace_context: SpanContext::empty_context(),
        }
    }

    pub fn with_trace_context(mut self, trace_context: SpanContext) -> Self {
        self.trace_context = trace_context;
        self
    }

    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }

    pub fn trace_id(&self) -> String {
        format_trace_id(&self.trace_context)
    }
}

#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Success {
        record: OutboundRecord,
        partition: i32,
        offset: i64,
    },
    Failure {
        record: OutboundRecord,
        partition: Option<i32>,
        offset: Option<i64>,
        cause: rdkafka::error::KafkaError,
    },
}

impl DeliveryOutcome {
    pub fn record(&self) -> &OutboundRecord {
        match self {
            DeliveryOutcome::Success { record, .. } => record,
            DeliveryOutcome::Failure { record, .. } => record,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }
}

fn format_trace_id(span_context: &SpanContext) -> String {
    if span_context.is_valid() {
        span_context.trace_id().to_string()
    } else {
        String::new()
    }
}
