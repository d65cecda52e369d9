use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};

use crate::error::QueueClosed;
use crate::metrics_consts::{DISPATCH_BACKPRESSURE, DISPATCH_QUEUE_DEPTH};

/// Fixed-capacity FIFO between the claim readers and the worker pool.
///
/// `enqueue` waits for a free slot instead of dropping, which is what pushes back on the
/// readers (and through them, on the broker fetch). Receivers share one end behind a lock, so
/// any number of workers can dequeue.
pub struct DispatchQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    closed: AtomicBool,
}

impl<T> DispatchQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn enqueue(&self, item: T) -> Result<(), QueueClosed> {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                metrics::counter!(DISPATCH_BACKPRESSURE).increment(1);
                self.tx.send(item).await.map_err(|_| QueueClosed)?;
            }
            Err(TrySendError::Closed(_)) => return Err(QueueClosed),
        }
        metrics::gauge!(DISPATCH_QUEUE_DEPTH).set(self.len() as f64);
        Ok(())
    }

    /// Waits for the next item. Returns `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<T> {
        let item = self.rx.lock().await.recv().await;
        metrics::gauge!(DISPATCH_QUEUE_DEPTH).set(self.len() as f64);
        item
    }

    pub async fn try_dequeue(&self) -> Option<T> {
        let item = self.rx.lock().await.try_recv().ok();
        metrics::gauge!(DISPATCH_QUEUE_DEPTH).set(self.len() as f64);
        item
    }

    /// Stops admitting items. Already buffered items can still be dequeued.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.rx.lock().await.close();
        }
    }
}
