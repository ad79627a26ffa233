// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduling block flushes off the write path.
//!
//! [`Manager::write`](crate::manager::Manager::write) only asks for a flush
//! through a [`BlockFlushEnqueuer`]. Two are provided:
//!
//! - [`InProcessFlusher`] flushes on a spawned task after a delay, keeping at
//!   most one pending flush per index.
//! - [`QueueFlusher`] hands a [`FlushJob`] to a channel drained by a
//!   [`FlushWorker`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::blockstore::{BlockFlusher, FlushOutcome};
use crate::error::{PauseError, Result};
use crate::manager::Manager;
use crate::pause::Index;

/// Requests that an index be flushed at some later point.
#[async_trait]
pub trait BlockFlushEnqueuer: Send + Sync {
    /// Ask for one block of `index` to be flushed.
    async fn enqueue(&self, index: &Index) -> Result<()>;
}

/// Payload of a queued flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushJob {
    /// The index to flush.
    pub index: Index,
}

/// Flushes on the local runtime.
pub struct InProcessFlusher {
    flusher: Arc<dyn BlockFlusher>,
    delay: Duration,
    pending: Arc<Mutex<HashSet<Index>>>,
    flushed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl InProcessFlusher {
    /// Create a flusher that waits `delay` before each flush.
    pub fn new(flusher: Arc<dyn BlockFlusher>, delay: Duration) -> Self {
        Self {
            flusher,
            delay,
            pending: Arc::new(Mutex::new(HashSet::new())),
            flushed: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Number of blocks written by this flusher.
    pub fn flushed_blocks(&self) -> u64 {
        self.flushed.load(Ordering::SeqCst)
    }

    /// Number of indexes with a flush pending or running.
    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Stop pending and running flushes.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl BlockFlushEnqueuer for InProcessFlusher {
    async fn enqueue(&self, index: &Index) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PauseError::Cancelled);
        }
        if !self.pending.lock().await.insert(index.clone()) {
            debug!(index = %index, "Flush already pending");
            return Ok(());
        }

        let flusher = self.flusher.clone();
        let pending = self.pending.clone();
        let flushed = self.flushed.clone();
        let cancel = self.cancel.clone();
        let delay = self.delay;
        let index = index.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    match flusher.flush_index_block(&index, &cancel).await {
                        Ok(FlushOutcome::Flushed { .. }) => {
                            flushed.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(outcome) => debug!(index = %index, ?outcome, "Flush did not write a block"),
                        Err(e) => error!(index = %index, error = %e, "Block flush failed"),
                    }
                }
            }
            pending.lock().await.remove(&index);
        });

        Ok(())
    }
}

/// Sends flush jobs to a bounded channel.
///
/// A full channel drops the request; the next write past the threshold asks again.
#[derive(Clone)]
pub struct QueueFlusher {
    tx: mpsc::Sender<FlushJob>,
}

impl QueueFlusher {
    /// Create a flusher and the receiving end for a [`FlushWorker`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FlushJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl BlockFlushEnqueuer for QueueFlusher {
    async fn enqueue(&self, index: &Index) -> Result<()> {
        match self.tx.try_send(FlushJob {
            index: index.clone(),
        }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                debug!(index = %job.index, "Flush queue full, dropping request");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(PauseError::Task("flush queue closed".to_string()))
            }
        }
    }
}

/// Drains flush jobs and flushes through a [`Manager`].
pub struct FlushWorker {
    manager: Arc<Manager>,
    rx: mpsc::Receiver<FlushJob>,
    shutdown: Arc<Notify>,
    cancel: CancellationToken,
}

impl FlushWorker {
    /// Create a worker over the receiving end of [`QueueFlusher::channel`].
    pub fn new(manager: Arc<Manager>, rx: mpsc::Receiver<FlushJob>) -> Self {
        Self {
            manager,
            rx,
            shutdown: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Process jobs until shutdown is signalled or every sender is dropped.
    pub async fn run(mut self) {
        info!("Flush worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Flush worker shutting down");
                    self.cancel.cancel();
                    break;
                }
                job = self.rx.recv() => {
                    let Some(job) = job else {
                        info!("Flush queue closed, stopping worker");
                        break;
                    };
                    // A flush may sit in its delay for a while.
                    tokio::select! {
                        _ = self.shutdown.notified() => {
                            info!("Flush worker shutting down mid-flush");
                            self.cancel.cancel();
                            break;
                        }
                        _ = self.process(job) => {}
                    }
                }
            }
        }
    }

    async fn process(&self, job: FlushJob) {
        match self.manager.flush_index_block(&job.index, &self.cancel).await {
            Ok(FlushOutcome::Flushed { block_id, len }) => {
                debug!(index = %job.index, block_id = %block_id, len, "Flush job complete");
            }
            Ok(outcome) => debug!(index = %job.index, ?outcome, "Flush job wrote no block"),
            Err(e) => error!(index = %job.index, error = %e, "Flush job failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    /// Counts flush calls and reports a fixed outcome.
    struct CountingFlusher {
        calls: AtomicUsize,
        latency: Duration,
    }

    #[async_trait]
    impl BlockFlusher for CountingFlusher {
        async fn flush_index_block(
            &self,
            _index: &Index,
            _cancel: &CancellationToken,
        ) -> Result<FlushOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            Ok(FlushOutcome::Flushed {
                block_id: ulid::Ulid::new(),
                len: 1,
            })
        }
    }

    #[tokio::test]
    async fn test_in_process_flusher_dedupes_pending_indexes() {
        let inner = Arc::new(CountingFlusher {
            calls: AtomicUsize::new(0),
            latency: Duration::from_millis(20),
        });
        let flusher = InProcessFlusher::new(inner.clone(), Duration::from_millis(10));
        let index = Index::new(Uuid::new_v4(), "evt.a");

        flusher.enqueue(&index).await.unwrap();
        flusher.enqueue(&index).await.unwrap();
        flusher
            .enqueue(&Index::new(index.workspace_id, "evt.b"))
            .await
            .unwrap();
        assert_eq!(flusher.pending().await, 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(flusher.flushed_blocks(), 2);
        assert_eq!(flusher.pending().await, 0);

        // Done flushes no longer block new requests.
        flusher.enqueue(&index).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_in_process_flusher_shutdown() {
        let inner = Arc::new(CountingFlusher {
            calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
        });
        let flusher = InProcessFlusher::new(inner.clone(), Duration::from_secs(60));
        let index = Index::new(Uuid::new_v4(), "evt.a");

        flusher.enqueue(&index).await.unwrap();
        flusher.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            flusher.enqueue(&index).await.unwrap_err(),
            PauseError::Cancelled
        ));
    }

    #[tokio::test]
    async fn test_queue_flusher_sends_jobs() {
        let (flusher, mut rx) = QueueFlusher::channel(1);
        let index = Index::new(Uuid::new_v4(), "evt.a");

        flusher.enqueue(&index).await.unwrap();
        // Full: dropped without error.
        flusher.enqueue(&index).await.unwrap();

        let job = rx.recv().await.unwrap();
        assert_eq!(job.index, index);
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(flusher.enqueue(&index).await.is_err());
    }

    #[tokio::test]
    async fn test_flush_worker_stops_during_flush_delay() {
        let pool = crate::migrations::test_pool().await;
        let buffer = Arc::new(crate::buffer::SqliteBufferer::new(pool.clone()));
        let leaser = Arc::new(crate::leaser::SqliteBlockLeaser::new(
            pool.clone(),
            crate::leaser::FLUSH_LEASE_PREFIX,
            Duration::from_secs(30),
        ));
        let bs = Arc::new(crate::blockstore::Blockstore::new(
            pool,
            buffer.clone(),
            leaser,
            Arc::new(object_store::memory::InMemory::new()),
            Default::default(),
        ));
        let manager = Arc::new(
            Manager::builder(buffer)
                .blockstore(bs)
                .flush_delay(Duration::from_secs(60))
                .build(),
        );
        let (flusher, rx) = QueueFlusher::channel(4);
        let worker = FlushWorker::new(manager, rx);
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(worker.run());

        flusher
            .enqueue(&Index::new(Uuid::new_v4(), "evt.a"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker stops without waiting out the delay")
            .unwrap();
    }

    #[test]
    fn test_flush_job_payload_carries_index() {
        let job = FlushJob {
            index: Index::new(Uuid::nil(), "evt.a"),
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["index"]["eventName"], "evt.a");
        assert_eq!(
            json["index"]["workspaceID"],
            "00000000-0000-0000-0000-000000000000"
        );
    }
}
