// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wiring a complete pause store from [`Config`].

use std::str::FromStr;
use std::sync::Arc;

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use crate::blockstore::{Blockstore, BlockstoreOpts};
use crate::buffer::SqliteBufferer;
use crate::config::Config;
use crate::dual_iter::DualIterOpts;
use crate::error::Result;
use crate::flusher::InProcessFlusher;
use crate::leaser::{FLUSH_LEASE_PREFIX, SqliteBlockLeaser};
use crate::manager::Manager;
use crate::migrations;

/// A connected pause store with in-process flushing.
pub struct PauseStore {
    pool: SqlitePool,
    buffer: Arc<SqliteBufferer>,
    blockstore: Arc<Blockstore>,
    flusher: Arc<InProcessFlusher>,
    manager: Arc<Manager>,
}

impl PauseStore {
    /// Connect to the database, apply migrations and open the blob store.
    ///
    /// In-memory databases are limited to a single connection, since every
    /// SQLite connection to `:memory:` opens a separate database.
    pub async fn connect(config: &Config) -> Result<Self> {
        let in_memory = config.database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await?;
        migrations::run_sqlite(&pool).await?;

        let bucket: Arc<dyn ObjectStore> = match &config.blob_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                Arc::new(LocalFileSystem::new_with_prefix(dir)?)
            }
            None => Arc::new(InMemory::new()),
        };

        let store = Self::from_parts(pool, bucket, config);
        info!(
            block_size = config.block_size,
            blob_dir = ?config.blob_dir,
            "Pause store connected"
        );
        Ok(store)
    }

    /// Assemble a store over an already migrated pool and a blob store.
    pub fn from_parts(pool: SqlitePool, bucket: Arc<dyn ObjectStore>, config: &Config) -> Self {
        let buffer = Arc::new(SqliteBufferer::new(pool.clone()));
        let leaser = Arc::new(SqliteBlockLeaser::new(
            pool.clone(),
            FLUSH_LEASE_PREFIX,
            config.lease_duration,
        ));
        let blockstore = Arc::new(Blockstore::new(
            pool.clone(),
            buffer.clone(),
            leaser,
            bucket,
            BlockstoreOpts {
                block_size: config.block_size,
                renew_interval: config.lease_renew_interval,
            },
        ));
        let flusher = Arc::new(InProcessFlusher::new(
            blockstore.clone(),
            config.flush_delay,
        ));

        let manager = Manager::builder(buffer.clone())
            .blockstore(blockstore.clone())
            .enqueuer(flusher.clone())
            .flush_delay(config.flush_delay)
            .iter_opts(DualIterOpts {
                concurrency: config.fetch_concurrency,
                ..Default::default()
            })
            .build();

        Self {
            pool,
            buffer,
            blockstore,
            flusher,
            manager: Arc::new(manager),
        }
    }

    /// The manager used to read and write pauses.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// The buffer, for maintenance such as [`SqliteBufferer::evict_expired`].
    pub fn buffer(&self) -> &Arc<SqliteBufferer> {
        &self.buffer
    }

    /// The block store.
    pub fn blockstore(&self) -> &Arc<Blockstore> {
        &self.blockstore
    }

    /// The in-process flusher receiving flush requests.
    pub fn flusher(&self) -> &Arc<InProcessFlusher> {
        &self.flusher
    }

    /// Stop background flushes and close the database pool.
    pub async fn close(&self) {
        self.flusher.shutdown();
        self.pool.close().await;
    }
}
