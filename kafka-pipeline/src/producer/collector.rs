use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::message::DeliveryOutcome;
use crate::metrics_consts::PRODUCER_DELIVERIES;

/// Notified of every delivery outcome, after it has been logged.
pub trait DeliveryObserver: Send + Sync {
    fn on_delivery(&self, outcome: &DeliveryOutcome);
}

/// Drains the success stream until the broker client drops its end.
pub async fn collect_successes(
    mut successes: mpsc::UnboundedReceiver<DeliveryOutcome>,
    observer: Option<Arc<dyn DeliveryObserver>>,
) {
    while let Some(outcome) = successes.recv().await {
        if let DeliveryOutcome::Success {
            record,
            partition,
            offset,
        } = &outcome
        {
            metrics::counter!(PRODUCER_DELIVERIES, "outcome" => "success").increment(1);
            info!(
                topic = %record.topic,
                partition,
                offset,
                key = %record.key,
                value = %record.value_str(),
                trace_id = %record.trace_id(),
                "pushed kafka message"
            );
        }
        if let Some(observer) = &observer {
            observer.on_delivery(&outcome);
        }
    }
    debug!("success collector stopped");
}

/// Drains the error stream until the broker client drops its end.
pub async fn collect_errors(
    mut errors: mpsc::UnboundedReceiver<DeliveryOutcome>,
    observer: Option<Arc<dyn DeliveryObserver>>,
) {
    while let Some(outcome) = errors.recv().await {
        if let DeliveryOutcome::Failure {
            record,
            partition,
            offset,
            cause,
        } = &outcome
        {
            metrics::counter!(PRODUCER_DELIVERIES, "outcome" => "failure").increment(1);
            error!(
                topic = %record.topic,
                partition = ?partition,
                offset = ?offset,
                key = %record.key,
                value = %record.value_str(),
                error = %cause,
                "failed to push kafka message"
            );
        }
        if let Some(observer) = &observer {
            observer.on_delivery(&outcome);
        }
    }
    debug!("error collector stopped");
}
