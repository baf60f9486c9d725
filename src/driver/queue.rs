//! Driver operation queue.
//!
//! A single FIFO queue serializes every verb against one backing store:
//! callers run strictly in arrival order, and a queued operation finishes its
//! backing I/O and its store apply/publish before the next one starts. This
//! is the primary ordering and backpressure guarantee of the disk driver:
//! two operations never interleave their writes.

use crate::error::{Result, TreeError};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type QueuedOp = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Queue statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    /// Operations accepted but not yet finished.
    pub pending: usize,
    /// Operations run to completion.
    pub completed: usize,
}

/// FIFO execution queue with a single worker task.
pub(crate) struct OpQueue {
    submit_tx: Mutex<Option<mpsc::UnboundedSender<QueuedOp>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<QueuedOp>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stats: Arc<RwLock<QueueStats>>,
}

impl OpQueue {
    pub(crate) fn new() -> OpQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        OpQueue {
            submit_tx: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
            stats: Arc::new(RwLock::new(QueueStats::default())),
        }
    }

    /// Spawn the worker. Must run inside a tokio runtime; called from the
    /// driver's `open()`.
    pub(crate) fn start(&self) {
        let Some(mut rx) = self.receiver.lock().take() else {
            return; // Already started.
        };
        let stats = Arc::clone(&self.stats);
        let handle = tokio::spawn(async move {
            debug!("op queue worker started");
            while let Some(op) = rx.recv().await {
                op.await;
                let mut s = stats.write();
                s.pending = s.pending.saturating_sub(1);
                s.completed += 1;
            }
            debug!("op queue worker drained and stopped");
        });
        *self.worker.lock() = Some(handle);
    }

    /// Enqueue `fut` and wait for its result. Operations complete strictly
    /// in submission order.
    pub(crate) async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let guard = self.submit_tx.lock();
            let sender = guard.as_ref().ok_or(TreeError::Closed)?;
            sender
                .send(Box::pin(async move {
                    let _ = done_tx.send(fut.await);
                }))
                .map_err(|_| TreeError::Closed)?;
            self.stats.write().pending += 1;
        }
        trace!("operation enqueued");
        done_rx.await.map_err(|_| TreeError::Closed)?
    }

    /// Stop accepting work, drain what is queued, and join the worker.
    pub(crate) async fn stop(&self) {
        self.submit_tx.lock().take();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    #[allow(dead_code)]
    pub(crate) fn stats(&self) -> QueueStats {
        *self.stats.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn operations_complete_in_arrival_order() {
        let queue = Arc::new(OpQueue::new());
        queue.start();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut joins = Vec::new();
        for i in 0..8u32 {
            let queue = Arc::clone(&queue);
            let seen = Arc::clone(&seen);
            joins.push(tokio::spawn(async move {
                queue
                    .run(async move {
                        // Earlier ops sleep longer; FIFO still preserves order.
                        tokio::time::sleep(Duration::from_millis((8 - i) as u64)).await;
                        seen.lock().push(i);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
            // Ensure deterministic submission order.
            tokio::task::yield_now().await;
        }
        for join in joins {
            join.await.unwrap();
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn stop_drains_queued_work() {
        let queue = Arc::new(OpQueue::new());
        queue.start();
        let counter = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            let queue2 = Arc::clone(&queue);
            receivers.push(tokio::spawn(async move {
                queue2
                    .run(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }
        queue.stop().await;
        for r in receivers {
            r.await.unwrap().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);

        let err = queue.run(async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, TreeError::Closed));
    }
}
