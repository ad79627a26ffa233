// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for durapause-core integration tests.
//!
//! Provides TestContext wiring an in-memory database and blob store.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use object_store::memory::InMemory;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use ulid::Ulid;
use uuid::Uuid;

use durapause_core::blockstore::{Blockstore, BlockstoreOpts};
use durapause_core::buffer::SqliteBufferer;
use durapause_core::iter::PauseIterator;
use durapause_core::leaser::{FLUSH_LEASE_PREFIX, SqliteBlockLeaser};
use durapause_core::manager::{Manager, ManagerBuilder};
use durapause_core::migrations;
use durapause_core::pause::{Index, Pause, RunIdentifier};

/// Test context holding one pause store over an in-memory database.
pub struct TestContext {
    pub pool: SqlitePool,
    pub buffer: Arc<SqliteBufferer>,
    pub leaser: Arc<SqliteBlockLeaser>,
    pub blockstore: Arc<Blockstore>,
    pub index: Index,
    base: DateTime<Utc>,
    clock: AtomicI64,
}

impl TestContext {
    /// Create a context whose blocks hold `block_size` pauses.
    pub async fn new(block_size: usize) -> Self {
        durapause_core::telemetry::init_tracing();

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        let buffer = Arc::new(SqliteBufferer::new(pool.clone()));
        let leaser = Arc::new(SqliteBlockLeaser::new(
            pool.clone(),
            FLUSH_LEASE_PREFIX,
            Duration::from_secs(30),
        ));
        let blockstore = Arc::new(Blockstore::new(
            pool.clone(),
            buffer.clone(),
            leaser.clone(),
            Arc::new(InMemory::new()),
            BlockstoreOpts {
                block_size,
                renew_interval: Duration::from_secs(10),
            },
        ));

        Self {
            pool,
            buffer,
            leaser,
            blockstore,
            index: Index::new(Uuid::new_v4(), "evt.a"),
            base: base_time(),
            clock: AtomicI64::new(0),
        }
    }

    /// A manager builder over this context's buffer and block store, with no flush delay.
    pub fn manager_builder(&self) -> ManagerBuilder {
        Manager::builder(self.buffer.clone())
            .blockstore(self.blockstore.clone())
            .flush_delay(Duration::ZERO)
    }

    /// A manager without an enqueuer; flushes only happen when asked for.
    pub fn manager(&self) -> Manager {
        self.manager_builder().build()
    }

    /// A new pause for this context's index, created 1ms after the previous one.
    pub fn pause(&self) -> Pause {
        let tick = self.clock.fetch_add(1, Ordering::SeqCst);
        let created_at = self.base + chrono::Duration::milliseconds(tick);

        let identifier = RunIdentifier {
            run_id: Ulid::new(),
            function_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
        };
        let mut pause = Pause::new(
            self.index.workspace_id,
            identifier,
            Some(self.index.event_name.clone()),
            Utc::now() + chrono::Duration::hours(1),
        );
        pause.created_at = Some(created_at);
        pause
    }

    /// `n` new pauses, oldest first.
    pub fn pauses(&self, n: usize) -> Vec<Pause> {
        (0..n).map(|_| self.pause()).collect()
    }
}

/// Creation times start a minute in the past so every pause is flushable.
fn base_time() -> DateTime<Utc> {
    let now = Utc::now() - chrono::Duration::seconds(60);
    DateTime::from_timestamp_millis(now.timestamp_millis()).expect("valid timestamp")
}

/// Drain an iterator, failing the test if it ends with an error.
pub async fn drain(mut iter: Box<dyn PauseIterator>) -> Vec<Pause> {
    let mut out = Vec::new();
    while iter.next().await {
        out.push(iter.val().cloned().expect("value after next"));
    }
    if let Some(err) = iter.error() {
        panic!("iteration failed: {err}");
    }
    out
}

/// Poll `check` every 20ms until it holds, for up to five seconds.
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
