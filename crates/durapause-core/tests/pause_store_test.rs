// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests across the buffer, block store, leases and flushers.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use object_store::memory::InMemory;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;
use uuid::Uuid;

use common::{TestContext, drain, wait_for};
use durapause_core::blockstore::{
    BlockFlusher, BlockReader, Blockstore, BlockstoreOpts, FlushOutcome,
};
use durapause_core::buffer::{Bufferer, Consumption, SqliteBufferer};
use durapause_core::iter::PauseIterator;
use durapause_core::pause::{Index, Pause};
use durapause_core::dual_iter::DualIterOpts;
use durapause_core::error::{PauseError, Result};
use durapause_core::flusher::{FlushWorker, InProcessFlusher, QueueFlusher};
use durapause_core::leaser::{BlockLeaser, FLUSH_LEASE_PREFIX, SqliteBlockLeaser};
use durapause_core::{Config, PauseStore};

fn ids(pauses: &[Pause]) -> HashSet<Uuid> {
    pauses.iter().map(|p| p.id).collect()
}

#[tokio::test]
async fn test_write_flush_read_and_delete_across_layers() {
    let ctx = TestContext::new(1).await;
    let manager = ctx.manager();
    let cancel = CancellationToken::new();
    let pauses = ctx.pauses(2);

    assert_eq!(manager.write(&ctx.index, &pauses).await.unwrap(), 2);
    let iter = manager.pauses_since(&ctx.index, None, &cancel).await.unwrap();
    assert_eq!(iter.count(), 2);

    let outcome = manager.flush_index_block(&ctx.index, &cancel).await.unwrap();
    let FlushOutcome::Flushed { block_id, len } = outcome else {
        panic!("expected a block, got {outcome:?}");
    };
    assert_eq!(len, 1);
    assert_eq!(manager.buffer_len(&ctx.index).await.unwrap(), 1);

    let block = ctx.blockstore.read_block(&ctx.index, block_id).await.unwrap();
    assert_eq!(block.pauses.len(), 1);
    assert_eq!(block.pauses[0].id, pauses[0].id);

    let iter = manager.pauses_since(&ctx.index, None, &cancel).await.unwrap();
    assert_eq!(iter.count(), 2);
    assert_eq!(ids(&drain(iter).await), ids(&pauses));

    // The buffered pause is removed outright.
    manager.delete(&ctx.index, &pauses[1]).await.unwrap();
    assert_eq!(manager.buffer_len(&ctx.index).await.unwrap(), 0);

    // The flushed one is soft-deleted in its block.
    manager.delete(&ctx.index, &pauses[0]).await.unwrap();
    let deleted = manager.block_deleted_ids(&ctx.index, block_id).await.unwrap();
    assert!(deleted.contains(&pauses[0].id));

    let iter = manager.pauses_since(&ctx.index, None, &cancel).await.unwrap();
    assert!(drain(iter).await.is_empty());
}

#[tokio::test]
async fn test_no_pause_lost_across_many_blocks() {
    let ctx = TestContext::new(5).await;
    let manager = ctx
        .manager_builder()
        .iter_opts(DualIterOpts {
            concurrency: 2,
            ..Default::default()
        })
        .build();
    let cancel = CancellationToken::new();
    let pauses = ctx.pauses(23);
    manager.write(&ctx.index, &pauses).await.unwrap();

    for _ in 0..4 {
        let outcome = ctx
            .blockstore
            .flush_index_block(&ctx.index, &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, FlushOutcome::Flushed { len: 5, .. }));
    }
    // Three left over: not enough for another block.
    let outcome = ctx
        .blockstore
        .flush_index_block(&ctx.index, &cancel)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FlushOutcome::Insufficient {
            found: 3,
            required: 5
        }
    );

    let stats = manager.index_stats(&ctx.index).await.unwrap();
    assert_eq!(stats.buffer_len, 3);
    assert_eq!(stats.blocks.len(), 4);
    for pair in stats.blocks.windows(2) {
        assert!(pair[0].last_timestamp < pair[1].first_timestamp);
    }

    let iter = manager.pauses_since(&ctx.index, None, &cancel).await.unwrap();
    assert_eq!(iter.count(), 23);
    let read = drain(iter).await;
    assert_eq!(read.len(), 23);
    assert_eq!(ids(&read), ids(&pauses));
}

#[tokio::test]
async fn test_pauses_since_spans_blocks_and_buffer() {
    let ctx = TestContext::new(5).await;
    let manager = ctx.manager();
    let cancel = CancellationToken::new();
    let pauses = ctx.pauses(23);
    manager.write(&ctx.index, &pauses).await.unwrap();
    for _ in 0..4 {
        ctx.blockstore
            .flush_index_block(&ctx.index, &cancel)
            .await
            .unwrap();
    }

    let since = pauses[12].created_at;
    let iter = manager.pauses_since(&ctx.index, since, &cancel).await.unwrap();
    let read = drain(iter).await;

    assert_eq!(ids(&read), ids(&pauses[12..]));
}

#[tokio::test]
async fn test_threshold_write_triggers_exactly_one_flush() {
    let ctx = TestContext::new(5).await;
    let flusher = Arc::new(InProcessFlusher::new(ctx.blockstore.clone(), Duration::ZERO));
    let manager = ctx.manager_builder().enqueuer(flusher.clone()).build();

    for pause in ctx.pauses(5) {
        manager.write(&ctx.index, &[pause]).await.unwrap();
    }
    assert_eq!(flusher.pending().await, 0);

    assert_eq!(manager.write(&ctx.index, &[ctx.pause()]).await.unwrap(), 6);

    let flushed = wait_for(|| {
        let flusher = flusher.clone();
        async move { flusher.flushed_blocks() == 1 && flusher.pending().await == 0 }
    })
    .await;
    assert!(flushed, "flush never completed");

    assert_eq!(manager.buffer_len(&ctx.index).await.unwrap(), 1);
    let blocks = ctx.blockstore.block_metadata(&ctx.index).await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].len, 5);

    flusher.shutdown();
}

#[tokio::test]
async fn test_queue_worker_flushes_enqueued_index() {
    let ctx = TestContext::new(2).await;
    let (queue, rx) = QueueFlusher::channel(16);
    let manager = Arc::new(ctx.manager_builder().enqueuer(Arc::new(queue)).build());

    let worker = FlushWorker::new(manager.clone(), rx);
    let shutdown = worker.shutdown_handle();
    let handle = tokio::spawn(worker.run());

    manager.write(&ctx.index, &ctx.pauses(3)).await.unwrap();

    let blockstore = ctx.blockstore.clone();
    let index = ctx.index.clone();
    let flushed = wait_for(|| {
        let blockstore = blockstore.clone();
        let index = index.clone();
        async move { blockstore.block_metadata(&index).await.unwrap().len() == 1 }
    })
    .await;
    assert!(flushed, "worker never flushed");
    assert_eq!(manager.buffer_len(&ctx.index).await.unwrap(), 1);

    shutdown.notify_one();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_consuming_flushed_pause_soft_deletes_it() {
    let ctx = TestContext::new(2).await;
    let manager = ctx.manager();
    let cancel = CancellationToken::new();
    let pauses = ctx.pauses(3);
    manager.write(&ctx.index, &pauses).await.unwrap();
    manager.flush_index_block(&ctx.index, &cancel).await.unwrap();

    // Lookups fall back to the block once the buffer copy is gone.
    let found = manager.pause_by_id(&ctx.index, pauses[0].id).await.unwrap();
    assert_eq!(found.id, pauses[0].id);

    let data = serde_json::json!({"name": "evt.a", "data": {"ok": true}});
    let first = manager
        .consume_pause(&ctx.index, &pauses[0], Some(&data))
        .await
        .unwrap();
    let second = manager
        .consume_pause(&ctx.index, &pauses[0], None)
        .await
        .unwrap();
    assert!(first.did_consume);
    assert!(!second.did_consume);

    let stats = manager.index_stats(&ctx.index).await.unwrap();
    assert_eq!(stats.blocks.len(), 1);
    assert_eq!(stats.blocks[0].delete_count, 1);

    let iter = manager.pauses_since(&ctx.index, None, &cancel).await.unwrap();
    assert_eq!(ids(&drain(iter).await), ids(&pauses[1..]));

    let consumption = ctx.buffer.consumption(pauses[0].id).await.unwrap().unwrap();
    assert_eq!(consumption.data, Some(data));
}

#[tokio::test]
async fn test_concurrent_workers_share_one_lease() {
    let ctx = TestContext::new(1).await;
    let workers: Vec<SqliteBlockLeaser> = (0..10)
        .map(|_| {
            SqliteBlockLeaser::new(
                ctx.pool.clone(),
                FLUSH_LEASE_PREFIX,
                Duration::from_secs(30),
            )
        })
        .collect();

    let results = join_all(workers.iter().map(|w| w.lease(&ctx.index))).await;

    let won: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(won.len(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(PauseError::is_contention)
    );
}

#[tokio::test]
async fn test_lease_handover_between_workers() {
    let ctx = TestContext::new(1).await;
    let a = SqliteBlockLeaser::new(ctx.pool.clone(), FLUSH_LEASE_PREFIX, Duration::from_secs(30));
    let b = SqliteBlockLeaser::new(ctx.pool.clone(), FLUSH_LEASE_PREFIX, Duration::from_secs(30));

    let first = a.lease(&ctx.index).await.unwrap();
    let renewed = a.renew(&ctx.index, first).await.unwrap();
    assert_ne!(renewed, first);
    assert!(renewed.timestamp_ms() >= first.timestamp_ms());

    // A stale ID is no longer valid for anyone.
    assert!(b.renew(&ctx.index, first).await.unwrap_err().is_contention());
    assert!(b.lease(&ctx.index).await.unwrap_err().is_contention());

    a.revoke(&ctx.index, renewed).await.unwrap();
    assert!(b.lease(&ctx.index).await.is_ok());
}

#[tokio::test]
async fn test_flush_skipped_while_another_worker_holds_lease() {
    let ctx = TestContext::new(1).await;
    let manager = ctx.manager();
    manager.write(&ctx.index, &ctx.pauses(2)).await.unwrap();

    let held = ctx.leaser.lease(&ctx.index).await.unwrap();
    let outcome = manager
        .flush_index_block(&ctx.index, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, FlushOutcome::Leased);
    assert_eq!(manager.buffer_len(&ctx.index).await.unwrap(), 2);

    ctx.leaser.revoke(&ctx.index, held).await.unwrap();
    let outcome = manager
        .flush_index_block(&ctx.index, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, FlushOutcome::Flushed { len: 1, .. }));
}

#[tokio::test]
async fn test_connected_store_flushes_in_background() {
    let mut config = Config::new("sqlite::memory:");
    config.block_size = 2;
    config.flush_delay = Duration::ZERO;

    let store = PauseStore::connect(&config).await.unwrap();
    let ctx_index = durapause_core::Index::new(Uuid::new_v4(), "evt.a");
    let pauses: Vec<_> = (0..3)
        .map(|i| {
            let mut p = durapause_core::Pause::new(
                ctx_index.workspace_id,
                durapause_core::RunIdentifier {
                    run_id: ulid::Ulid::new(),
                    function_id: Uuid::new_v4(),
                    account_id: Uuid::new_v4(),
                },
                Some("evt.a".into()),
                chrono::Utc::now() + chrono::Duration::hours(1),
            );
            p.created_at = Some(chrono::Utc::now() - chrono::Duration::seconds(30 - i));
            p
        })
        .collect();

    store.manager().write(&ctx_index, &pauses).await.unwrap();

    let flusher = store.flusher().clone();
    let flushed = wait_for(|| {
        let flusher = flusher.clone();
        async move { flusher.flushed_blocks() == 1 }
    })
    .await;
    assert!(flushed, "background flush never completed");

    let stats = store.manager().index_stats(&ctx_index).await.unwrap();
    assert_eq!(stats.buffer_len, 1);
    assert_eq!(stats.blocks.len(), 1);
    assert_eq!(stats.blocks[0].len, 2);

    store.close().await;
}

/// Buffer whose deletes signal an interruption, then stall.
///
/// Models a flush being cancelled or losing its lease while flushed pauses
/// are still being removed from the buffer.
struct InterruptingBuffer {
    inner: SqliteBufferer,
    cancel: CancellationToken,
    interrupted: Arc<AtomicBool>,
    stall: Duration,
}

#[async_trait]
impl Bufferer for InterruptingBuffer {
    async fn write(&self, index: &Index, pauses: &[Pause]) -> Result<usize> {
        self.inner.write(index, pauses).await
    }

    async fn pauses_since(
        &self,
        index: &Index,
        since: Option<DateTime<Utc>>,
    ) -> Result<Box<dyn PauseIterator>> {
        self.inner.pauses_since(index, since).await
    }

    async fn pauses_since_limit(
        &self,
        index: &Index,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Pause>> {
        self.inner.pauses_since_limit(index, since, limit).await
    }

    async fn delete(&self, index: &Index, pause: &Pause) -> Result<()> {
        self.cancel.cancel();
        self.interrupted.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.stall).await;
        self.inner.delete(index, pause).await
    }

    async fn delete_by_id(&self, workspace_id: Uuid, pause_id: Uuid) -> Result<bool> {
        self.inner.delete_by_id(workspace_id, pause_id).await
    }

    async fn pause_timestamp(&self, index: &Index, pause: &Pause) -> Result<DateTime<Utc>> {
        self.inner.pause_timestamp(index, pause).await
    }

    async fn buffer_len(&self, index: &Index) -> Result<usize> {
        self.inner.buffer_len(index).await
    }

    async fn pause_by_id(&self, index: &Index, pause_id: Uuid) -> Result<Pause> {
        self.inner.pause_by_id(index, pause_id).await
    }

    async fn consume(&self, pause_id: Uuid, data: Option<&Value>) -> Result<bool> {
        self.inner.consume(pause_id, data).await
    }

    async fn consumption(&self, pause_id: Uuid) -> Result<Option<Consumption>> {
        self.inner.consumption(pause_id).await
    }
}

/// Leaser whose renewals are rejected once `revoked` is set.
struct RevokingLeaser {
    inner: SqliteBlockLeaser,
    revoked: Arc<AtomicBool>,
}

#[async_trait]
impl BlockLeaser for RevokingLeaser {
    async fn lease(&self, index: &Index) -> Result<Ulid> {
        self.inner.lease(index).await
    }

    async fn renew(&self, index: &Index, lease_id: Ulid) -> Result<Ulid> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(PauseError::LeaseRejected(index.clone()));
        }
        self.inner.renew(index, lease_id).await
    }

    async fn revoke(&self, index: &Index, lease_id: Ulid) -> Result<()> {
        self.inner.revoke(index, lease_id).await
    }
}

/// A block store over `ctx` whose buffer deletes are interrupted.
fn interrupted_blockstore(
    ctx: &TestContext,
    cancel: &CancellationToken,
    renew_interval: Duration,
) -> Blockstore {
    let interrupted = Arc::new(AtomicBool::new(false));
    let buffer = Arc::new(InterruptingBuffer {
        inner: SqliteBufferer::new(ctx.pool.clone()),
        cancel: cancel.clone(),
        interrupted: interrupted.clone(),
        stall: Duration::from_millis(30),
    });
    let leaser = Arc::new(RevokingLeaser {
        inner: SqliteBlockLeaser::new(ctx.pool.clone(), FLUSH_LEASE_PREFIX, Duration::from_secs(30)),
        revoked: interrupted,
    });
    Blockstore::new(
        ctx.pool.clone(),
        buffer,
        leaser,
        Arc::new(InMemory::new()),
        BlockstoreOpts {
            block_size: 3,
            renew_interval,
        },
    )
}

async fn assert_cleanup_completes(ctx: &TestContext, bs: Arc<Blockstore>, written: &[Pause]) {
    let buffer = ctx.buffer.clone();
    let index = ctx.index.clone();
    let cleaned = wait_for(|| {
        let buffer = buffer.clone();
        let index = index.clone();
        async move { buffer.buffer_len(&index).await.unwrap() == 0 }
    })
    .await;
    assert!(cleaned, "flushed pauses left in the buffer");

    assert_eq!(bs.block_metadata(&ctx.index).await.unwrap().len(), 1);

    let manager = durapause_core::Manager::builder(ctx.buffer.clone())
        .blockstore(bs)
        .build();
    let iter = manager
        .pauses_since(&ctx.index, None, &CancellationToken::new())
        .await
        .unwrap();
    let yielded = drain(iter).await;
    assert_eq!(yielded.len(), written.len());
    assert_eq!(ids(&yielded), ids(written));
}

#[tokio::test]
async fn test_cancel_during_buffer_cleanup_still_cleans_up() {
    let ctx = TestContext::new(3).await;
    let written = ctx.pauses(3);
    ctx.buffer.write(&ctx.index, &written).await.unwrap();

    let cancel = CancellationToken::new();
    let bs = Arc::new(interrupted_blockstore(&ctx, &cancel, Duration::from_secs(10)));

    let err = bs.flush_index_block(&ctx.index, &cancel).await.unwrap_err();
    assert!(matches!(err, PauseError::Cancelled));

    assert_cleanup_completes(&ctx, bs, &written).await;
}

#[tokio::test]
async fn test_lost_lease_during_buffer_cleanup_still_cleans_up() {
    let ctx = TestContext::new(3).await;
    let written = ctx.pauses(3);
    ctx.buffer.write(&ctx.index, &written).await.unwrap();

    // Never cancelled by the flush itself; only the renewal fails.
    let unrelated = CancellationToken::new();
    let bs = Arc::new(interrupted_blockstore(
        &ctx,
        &unrelated,
        Duration::from_millis(5),
    ));

    let err = bs
        .flush_index_block(&ctx.index, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PauseError::LeaseRejected(_)));

    assert_cleanup_completes(&ctx, bs, &written).await;
}

#[tokio::test]
async fn test_flushed_pause_left_in_buffer_is_yielded_once_and_deletable() {
    let ctx = TestContext::new(1).await;
    let manager = ctx.manager();
    let cancel = CancellationToken::new();
    let written = ctx.pauses(2);
    manager.write(&ctx.index, &written).await.unwrap();

    for _ in 0..2 {
        let outcome = manager.flush_index_block(&ctx.index, &cancel).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Flushed { len: 1, .. }));
    }
    assert_eq!(manager.buffer_len(&ctx.index).await.unwrap(), 0);

    // As if removing it from the buffer had failed after its flush.
    ctx.buffer.write(&ctx.index, &written[..1]).await.unwrap();

    let iter = manager.pauses_since(&ctx.index, None, &cancel).await.unwrap();
    let yielded = drain(iter).await;
    assert_eq!(yielded.len(), 2);
    assert_eq!(ids(&yielded), ids(&written));

    manager.delete(&ctx.index, &written[0]).await.unwrap();
    let iter = manager.pauses_since(&ctx.index, None, &cancel).await.unwrap();
    let yielded = drain(iter).await;
    assert_eq!(ids(&yielded), ids(&written[1..]));
}

#[tokio::test]
async fn test_flush_during_iteration_loses_no_pauses() {
    let ctx = TestContext::new(1500).await;
    let manager = ctx.manager();
    let cancel = CancellationToken::new();
    let written = ctx.pauses(2000);
    manager.write(&ctx.index, &written).await.unwrap();

    // The iterator has loaded its first page of the buffer; the rest is
    // read after the flush has moved the oldest pauses into a block.
    let mut iter = manager.pauses_since(&ctx.index, None, &cancel).await.unwrap();
    assert!(iter.next().await);
    let mut yielded = vec![iter.val().cloned().unwrap()];

    let outcome = manager.flush_index_block(&ctx.index, &cancel).await.unwrap();
    assert!(matches!(outcome, FlushOutcome::Flushed { len: 1500, .. }));

    yielded.extend(drain(iter).await);
    assert_eq!(yielded.len(), 2000);
    assert_eq!(ids(&yielded), ids(&written));
}

#[tokio::test]
async fn test_delete_by_id_buffered_and_flushed() {
    let ctx = TestContext::new(2).await;
    let manager = ctx.manager();
    let cancel = CancellationToken::new();
    let written = ctx.pauses(3);
    manager.write(&ctx.index, &written).await.unwrap();
    manager.flush_index_block(&ctx.index, &cancel).await.unwrap();

    let ws = ctx.index.workspace_id;
    assert!(manager.delete_by_id(ws, written[2].id).await.unwrap());
    assert!(manager.delete_by_id(ws, written[0].id).await.unwrap());
    assert!(!manager.delete_by_id(ws, Uuid::new_v4()).await.unwrap());

    let iter = manager.pauses_since(&ctx.index, None, &cancel).await.unwrap();
    assert_eq!(ids(&drain(iter).await), ids(&written[1..2]));
    assert_eq!(manager.buffer_len(&ctx.index).await.unwrap(), 0);
}
