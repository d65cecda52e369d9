use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::message::Partition;
use crate::metrics_consts::SESSIONS_STARTED;

/// One-shot latch: moves from unset to set exactly once and never resets.
#[derive(Debug)]
pub struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(false),
        }
    }
}

impl ReadySignal {
    /// Returns true only for the call that actually set the signal.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close under us
        if rx.wait_for(|ready| *ready).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A single generation of group membership, created on every (re)assignment.
#[derive(Debug)]
pub struct ConsumerSession {
    generation: u64,
    partitions: Vec<Partition>,
    ready: ReadySignal,
    done: CancellationToken,
}

impl ConsumerSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    pub async fn wait_ready(&self) {
        self.ready.wait().await
    }

    /// Cancelled when the session ends, by revocation or shutdown.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }
}

#[derive(Debug)]
pub struct SessionCoordinator {
    generation: AtomicU64,
    current: watch::Sender<Option<Arc<ConsumerSession>>>,
}

impl Default for SessionCoordinator {
    fn default() -> Self {
        Self {
            generation: AtomicU64::new(0),
            current: watch::Sender::new(None),
        }
    }
}

impl SessionCoordinator {
    /// Replaces the current session with a fresh one for `partitions`. The previous session is
    /// ended; its ready signal is never reused.
    pub fn begin_session(
        &self,
        partitions: Vec<Partition>,
        done: CancellationToken,
    ) -> Arc<ConsumerSession> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(ConsumerSession {
            generation,
            partitions,
            ready: ReadySignal::default(),
            done,
        });

        if let Some(previous) = self.current.send_replace(Some(session.clone())) {
            previous.done.cancel();
        }
        metrics::counter!(SESSIONS_STARTED).increment(1);
        session
    }

    pub fn mark_ready(&self, session: &ConsumerSession) {
        if session.ready.fire() {
            info!(
                generation = session.generation,
                partitions = ?session.partitions,
                "consumer session ready"
            );
        }
    }

    pub fn current(&self) -> Option<Arc<ConsumerSession>> {
        self.current.borrow().clone()
    }

    /// Blocks until the current session is ready, following rebalances that happen while
    /// waiting.
    pub async fn wait_ready(&self) -> Arc<ConsumerSession> {
        let mut rx = self.current.subscribe();
        loop {
            let session = rx.borrow_and_update().clone();
            match session {
                Some(session) if session.is_ready() => return session,
                Some(session) => {
                    tokio::select! {
                        _ = session.wait_ready() => return session,
                        _ = rx.changed() => {}
                    }
                }
                None => {
                    // Sender is owned by self
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }
}
