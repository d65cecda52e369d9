use rdkafka::message::DeliveryResult;
use rdkafka::producer::ProducerContext;
use rdkafka::{ClientContext, Message, Statistics};
use tokio::sync::mpsc;
use tracing::warn;

use super::partitioner::RoundRobinPartitioner;
use crate::message::{DeliveryOutcome, OutboundRecord};
use crate::metrics_consts::{
    PRODUCER_CALLBACK_QUEUE_DEPTH, PRODUCER_QUEUE_BYTES, PRODUCER_QUEUE_DEPTH,
    PRODUCER_QUEUE_DEPTH_LIMIT,
};

/// Owns the sending half of both result streams. It lives exactly as long as the broker
/// client, so dropping the client is what ends the collectors.
pub struct DeliveryContext {
    successes: mpsc::UnboundedSender<DeliveryOutcome>,
    errors: mpsc::UnboundedSender<DeliveryOutcome>,
    partitioner: RoundRobinPartitioner,
}

impl DeliveryContext {
    pub fn new(
        successes: mpsc::UnboundedSender<DeliveryOutcome>,
        errors: mpsc::UnboundedSender<DeliveryOutcome>,
    ) -> Self {
        Self {
            successes,
            errors,
            partitioner: RoundRobinPartitioner::default(),
        }
    }

    pub fn report(&self, outcome: DeliveryOutcome) {
        let stream = if outcome.is_success() {
            &self.successes
        } else {
            &self.errors
        };
        if stream.send(outcome).is_err() {
            warn!("delivery outcome dropped, collector is gone");
        }
    }
}

impl ClientContext for DeliveryContext {
    fn stats(&self, stats: Statistics) {
        metrics::gauge!(PRODUCER_CALLBACK_QUEUE_DEPTH).set(stats.replyq as f64);
        metrics::gauge!(PRODUCER_QUEUE_DEPTH).set(stats.msg_cnt as f64);
        metrics::gauge!(PRODUCER_QUEUE_DEPTH_LIMIT).set(stats.msg_max as f64);
        metrics::gauge!(PRODUCER_QUEUE_BYTES).set(stats.msg_size as f64);
    }
}

impl ProducerContext<RoundRobinPartitioner> for DeliveryContext {
    type DeliveryOpaque = Box<OutboundRecord>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, record: Self::DeliveryOpaque) {
        let outcome = match delivery_result {
            Ok(message) => DeliveryOutcome::Success {
                record: *record,
                partition: message.partition(),
                offset: message.offset(),
            },
            Err((cause, message)) => DeliveryOutcome::Failure {
                record: *record,
                partition: Some(message.partition()).filter(|p| *p >= 0),
                offset: Some(message.offset()).filter(|o| *o >= 0),
                cause: cause.clone(),
            },
        };
        self.report(outcome);
    }

    fn get_custom_partitioner(&self) -> Option<&RoundRobinPartitioner> {
        Some(&self.partitioner)
    }
}
