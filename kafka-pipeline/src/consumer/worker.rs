use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::claim::Dispatch;
use super::queue::DispatchQueue;
use crate::handler::{panic_message, HandlerError, MessageHandler};
use crate::metrics_consts::{ACTIVE_WORKERS, HANDLER_DURATION, HANDLER_OUTCOMES};

/// A fixed set of workers draining the dispatch queue into the handler.
pub struct WorkerPool {
    stop: CancellationToken,
    workers: JoinSet<()>,
}

impl WorkerPool {
    pub fn spawn(
        num_workers: usize,
        queue: Arc<DispatchQueue<Dispatch>>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        info!("starting worker pool with {} workers", num_workers);
        let stop = CancellationToken::new();
        let mut workers = JoinSet::new();

        for id in 0..num_workers {
            let worker = Worker {
                id,
                queue: queue.clone(),
                handler: handler.clone(),
            };
            workers.spawn(worker.run(stop.clone()));
        }

        Self { stop, workers }
    }

    /// Signals every worker to stop and waits for them. Workers only exit once the queue is
    /// empty, so everything buffered before this call gets handled.
    pub async fn stop_and_join(mut self) {
        self.stop.cancel();
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!("worker task failed: {}", e);
            }
        }
        info!("all workers exited");
    }
}

struct Worker {
    id: usize,
    queue: Arc<DispatchQueue<Dispatch>>,
    handler: Arc<dyn MessageHandler>,
}

impl Worker {
    async fn run(self, stop: CancellationToken) {
        metrics::gauge!(ACTIVE_WORKERS).increment(1.0);

        loop {
            tokio::select! {
                biased;
                item = self.queue.dequeue() => match item {
                    Some(dispatch) => self.process(dispatch).await,
                    None => break,
                },
                _ = stop.cancelled() => {
                    while let Some(dispatch) = self.queue.try_dequeue().await {
                        self.process(dispatch).await;
                    }
                    break;
                }
            }
        }

        metrics::gauge!(ACTIVE_WORKERS).decrement(1.0);
        info!(worker = self.id, "worker stopped");
    }

    async fn process(&self, dispatch: Dispatch) {
        let Dispatch { message, commit } = dispatch;
        let topic = message.topic.clone();
        let partition = message.partition;
        let offset = message.offset;

        let started = Instant::now();
        let result = AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));
        metrics::histogram!(HANDLER_DURATION).record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::counter!(HANDLER_OUTCOMES, "outcome" => "ok").increment(1);
                if let Some(commit) = commit {
                    commit.commit_or_log();
                }
            }
            Err(HandlerError::Panicked(reason)) => {
                metrics::counter!(HANDLER_OUTCOMES, "outcome" => "panicked").increment(1);
                error!(
                    worker = self.id,
                    topic = %topic,
                    partition,
                    offset,
                    "handler panicked: {}",
                    reason
                );
            }
            Err(e) => {
                metrics::counter!(HANDLER_OUTCOMES, "outcome" => "failed").increment(1);
                warn!(
                    worker = self.id,
                    topic = %topic,
                    partition,
                    offset,
                    error = %e,
                    "handler failed"
                );
            }
        }
    }
}
