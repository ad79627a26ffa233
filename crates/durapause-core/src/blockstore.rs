// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flushing buffered pauses into immutable blocks, and reading them back.
//!
//! ```text
//!   lease(index) ──► read buffer after last block ──► sort, take block_size
//!        │                                                     │
//!        │                          put blob  ◄── serialize ◄──┘
//!        │                              │
//!        │        ┌─────────── detached task ───────────────────┐
//!        │        │ commit metadata + pause→block index (one tx) │
//!        │        │ delete flushed pauses from buffer            │
//!        │        └──────────────────────────────────────────────┘
//!        └── renew ... ──► revoke
//! ```
//!
//! Block content never changes once written. Deleting a flushed pause records
//! a marker in `pause_block_deletes` which readers filter against.
//!
//! Once the blob is written, committing its metadata and removing its pauses
//! from the buffer runs to completion even if the flush is cancelled or loses
//! its lease. A pause left in both layers by a failed buffer delete is
//! deduplicated by readers and removed from both layers by
//! [`Manager::delete`](crate::manager::Manager::delete).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::ObjectStore;
use object_store::path::Path;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::block::{Block, BlockMetadata, DEFAULT_BLOCK_SIZE, block_id, block_key};
use crate::buffer::Bufferer;
use crate::error::{PauseError, Result};
use crate::leaser::{BlockLeaser, DEFAULT_RENEW_INTERVAL, with_lease};
use crate::pause::{Index, Pause, skip_flushing};
use crate::serializer::{self, Encoding};

/// Result of a flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// A block was written and its pauses removed from the buffer.
    Flushed {
        /// The new block.
        block_id: Ulid,
        /// Number of pauses in the block.
        len: usize,
    },
    /// Another worker holds the flush lease for this index.
    Leased,
    /// The index is never flushed; its pauses must stay in the buffer.
    Skipped,
    /// Too few pauses to fill a block. Partial blocks are never written.
    Insufficient {
        /// Pauses eligible for the block.
        found: usize,
        /// Pauses needed to fill the block.
        required: usize,
    },
}

/// Writes blocks from the buffer.
#[async_trait]
pub trait BlockFlusher: Send + Sync {
    /// Flush the oldest `block_size` unflushed pauses of an index into a block.
    async fn flush_index_block(
        &self,
        index: &Index,
        cancel: &CancellationToken,
    ) -> Result<FlushOutcome>;
}

/// Reads blocks and their metadata.
#[async_trait]
pub trait BlockReader: Send + Sync {
    /// Number of pauses per block.
    fn block_size(&self) -> usize;

    /// IDs of blocks holding pauses created at or after `since`, oldest first.
    async fn blocks_since(&self, index: &Index, since: Option<DateTime<Utc>>) -> Result<Vec<Ulid>>;

    /// Load a block's full content from blob storage.
    async fn read_block(&self, index: &Index, block_id: Ulid) -> Result<Block>;

    /// IDs of pauses soft-deleted within a block.
    async fn deleted_ids(&self, index: &Index, block_id: Ulid) -> Result<HashSet<Uuid>>;

    /// Metadata of the newest block, if any.
    async fn last_block_metadata(&self, index: &Index) -> Result<Option<BlockMetadata>>;

    /// Metadata of every block, oldest first.
    async fn block_metadata(&self, index: &Index) -> Result<Vec<BlockMetadata>>;

    /// Whether any blocks exist for an index.
    async fn index_exists(&self, index: &Index) -> Result<bool>;

    /// IDs of every pause written into a block, including soft-deleted ones.
    async fn block_pause_ids(&self, index: &Index, block_id: Ulid) -> Result<Vec<Uuid>>;

    /// Load a flushed, undeleted pause by ID.
    async fn pause_by_id(&self, index: &Index, pause_id: Uuid) -> Result<Pause>;
}

/// Full block layer: flushing, reading and soft deletes.
#[async_trait]
pub trait BlockStore: BlockFlusher + BlockReader {
    /// Mark a flushed pause deleted within its block. A pause that is in no
    /// block is left alone.
    async fn delete(&self, index: &Index, pause: &Pause) -> Result<()>;

    /// Mark a flushed pause deleted by ID within a workspace, whatever its
    /// event. Returns false if the pause is in no block.
    async fn delete_by_id(&self, workspace_id: Uuid, pause_id: Uuid) -> Result<bool>;
}

/// Tuning for [`Blockstore`].
#[derive(Debug, Clone)]
pub struct BlockstoreOpts {
    /// Pauses per block.
    pub block_size: usize,
    /// How often the flush lease is renewed while a flush runs.
    pub renew_interval: Duration,
}

impl Default for BlockstoreOpts {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BlockRow {
    block_id: String,
    earliest_ms: i64,
    latest_ms: i64,
    first_pause_id: Uuid,
    last_pause_id: Uuid,
    len: i64,
}

impl TryFrom<BlockRow> for BlockMetadata {
    type Error = PauseError;

    fn try_from(row: BlockRow) -> Result<Self> {
        Ok(Self {
            block_id: parse_ulid(&row.block_id)?,
            earliest_ms: row.earliest_ms,
            latest_ms: row.latest_ms,
            first_pause_id: row.first_pause_id,
            last_pause_id: row.last_pause_id,
            len: row.len as usize,
        })
    }
}

fn parse_ulid(s: &str) -> Result<Ulid> {
    Ulid::from_string(s).map_err(|e| PauseError::Integrity(format!("invalid block id '{s}': {e}")))
}

async fn mark_deleted(pool: &SqlitePool, block_id: Ulid, pause_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pause_block_deletes (block_id, pause_id, deleted_at)
        VALUES (?, ?, ?)
        ON CONFLICT (block_id, pause_id) DO NOTHING
        "#,
    )
    .bind(block_id.to_string())
    .bind(pause_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Commit a written block's metadata, then remove its pauses from the buffer.
///
/// Buffer deletes continue past failures; the number of pauses left behind
/// is returned.
async fn commit_block(
    pool: SqlitePool,
    buffer: Arc<dyn Bufferer>,
    block: Block,
    metadata: BlockMetadata,
) -> Result<usize> {
    let id = block.id;
    let index = &block.index;

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO pause_blocks
            (block_id, workspace_id, event_name, earliest_ms, latest_ms,
             first_pause_id, last_pause_id, len)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (block_id) DO NOTHING
        "#,
    )
    .bind(id.to_string())
    .bind(index.workspace_id)
    .bind(&index.event_name)
    .bind(metadata.earliest_ms)
    .bind(metadata.latest_ms)
    .bind(metadata.first_pause_id)
    .bind(metadata.last_pause_id)
    .bind(metadata.len as i64)
    .execute(&mut *tx)
    .await?;

    for pause in &block.pauses {
        sqlx::query(
            r#"
            INSERT INTO pause_block_index (pause_id, block_id, workspace_id, event_name)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (pause_id) DO NOTHING
            "#,
        )
        .bind(pause.id)
        .bind(id.to_string())
        .bind(index.workspace_id)
        .bind(&index.event_name)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    let mut left_behind = 0;
    for pause in &block.pauses {
        let cleaned = match buffer.delete(index, pause).await {
            Ok(()) => Ok(()),
            // Consumed while the block was being written.
            Err(e) if e.is_not_in_buffer() => mark_deleted(&pool, id, pause.id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = cleaned {
            left_behind += 1;
            warn!(
                block_id = %id,
                pause_id = %pause.id,
                error = %e,
                "Failed to remove flushed pause from buffer"
            );
        }
    }

    Ok(left_behind)
}

/// Block layer over an object store, with metadata kept in SQLite.
pub struct Blockstore {
    pool: SqlitePool,
    buffer: Arc<dyn Bufferer>,
    leaser: Arc<dyn BlockLeaser>,
    bucket: Arc<dyn ObjectStore>,
    opts: BlockstoreOpts,
}

impl Blockstore {
    /// Create a block store.
    pub fn new(
        pool: SqlitePool,
        buffer: Arc<dyn Bufferer>,
        leaser: Arc<dyn BlockLeaser>,
        bucket: Arc<dyn ObjectStore>,
        opts: BlockstoreOpts,
    ) -> Self {
        Self {
            pool,
            buffer,
            leaser,
            bucket,
            opts,
        }
    }

    /// Pauses read from the buffer per flush, beyond `block_size`, so that
    /// pauses deleted mid-flush don't starve the block.
    fn fetch_limit(&self) -> usize {
        self.opts.block_size + self.opts.block_size / 4
    }

    async fn is_in_block(&self, pause_id: Uuid) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT block_id FROM pause_block_index WHERE pause_id = ?")
                .bind(pause_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// The block holding a pause. An empty event name matches any event.
    async fn containing_block(
        &self,
        workspace_id: Uuid,
        event_name: &str,
        pause_id: Uuid,
    ) -> Result<Option<Ulid>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT block_id FROM pause_block_index
            WHERE pause_id = ?1 AND workspace_id = ?2 AND (?3 = '' OR event_name = ?3)
            "#,
        )
        .bind(pause_id)
        .bind(workspace_id)
        .bind(event_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id,)| parse_ulid(&id)).transpose()
    }

    /// Select the pauses for the next block, or the outcome explaining why
    /// there is no block to write.
    async fn next_block_pauses(
        &self,
        index: &Index,
    ) -> Result<std::result::Result<Vec<Pause>, FlushOutcome>> {
        let boundary = self.last_block_metadata(index).await?;
        let since = boundary.as_ref().map(BlockMetadata::last_timestamp);

        let fetched = self
            .buffer
            .pauses_since_limit(index, since, self.fetch_limit())
            .await?;

        if skip_flushing(index, &fetched) {
            return Ok(Err(FlushOutcome::Skipped));
        }

        let mut pauses = Vec::with_capacity(fetched.len());
        for pause in fetched {
            let Some(created_at) = pause.created_at else {
                continue;
            };
            // Pauses sharing the boundary millisecond may already be in the last block.
            let on_boundary = boundary
                .as_ref()
                .is_some_and(|md| created_at.timestamp_millis() == md.latest_ms);
            if on_boundary && self.is_in_block(pause.id).await? {
                continue;
            }
            pauses.push(pause);
        }

        pauses.sort_by_key(|p| p.created_at);

        let required = self.opts.block_size;
        if pauses.len() < required {
            return Ok(Err(FlushOutcome::Insufficient {
                found: pauses.len(),
                required,
            }));
        }

        pauses.truncate(required);
        Ok(Ok(pauses))
    }

    async fn flush_leased(&self, index: &Index) -> Result<FlushOutcome> {
        let pauses = match self.next_block_pauses(index).await? {
            Ok(pauses) => pauses,
            Err(FlushOutcome::Insufficient { found, required }) => {
                warn!(
                    workspace_id = %index.workspace_id,
                    event_name = %index.event_name,
                    found,
                    required,
                    "Not enough pauses to fill a block, aborting flush"
                );
                return Ok(FlushOutcome::Insufficient { found, required });
            }
            Err(outcome) => return Ok(outcome),
        };

        let mut metadata = BlockMetadata::for_pauses(&pauses)?;
        let id = block_id(&pauses, &metadata)?;
        metadata.block_id = id;

        let block = Block {
            id,
            index: index.clone(),
            pauses,
        };
        let len = block.pauses.len();
        let bytes = serializer::serialize(&block, Encoding::Json, 0x00)?;
        let size = bytes.len();

        self.bucket
            .put(&Path::from(block_key(index, id)), bytes.into())
            .await?;

        // Dropping this future must not stop the commit and cleanup halfway.
        let left_behind = tokio::spawn(commit_block(
            self.pool.clone(),
            self.buffer.clone(),
            block,
            metadata,
        ))
        .await
        .map_err(|e| PauseError::Task(e.to_string()))??;

        info!(
            workspace_id = %index.workspace_id,
            event_name = %index.event_name,
            block_id = %id,
            len,
            bytes = size,
            left_behind,
            "Flushed block"
        );

        Ok(FlushOutcome::Flushed { block_id: id, len })
    }
}

#[async_trait]
impl BlockFlusher for Blockstore {
    #[instrument(skip(self, cancel), fields(index = %index))]
    async fn flush_index_block(
        &self,
        index: &Index,
        cancel: &CancellationToken,
    ) -> Result<FlushOutcome> {
        if index.event_name.is_empty() {
            return Ok(FlushOutcome::Skipped);
        }

        let result = with_lease(
            self.leaser.as_ref(),
            index,
            self.opts.renew_interval,
            cancel,
            |_| self.flush_leased(index),
        )
        .await;

        match result {
            Err(PauseError::AlreadyLeased(_)) => {
                debug!("Index is being flushed elsewhere");
                Ok(FlushOutcome::Leased)
            }
            other => other,
        }
    }
}

#[async_trait]
impl BlockReader for Blockstore {
    fn block_size(&self) -> usize {
        self.opts.block_size
    }

    async fn blocks_since(&self, index: &Index, since: Option<DateTime<Utc>>) -> Result<Vec<Ulid>> {
        let since_ms = since.map(|s| s.timestamp_millis()).unwrap_or(i64::MIN);
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT block_id FROM pause_blocks
            WHERE workspace_id = ? AND event_name = ? AND latest_ms >= ?
            ORDER BY latest_ms ASC, block_id ASC
            "#,
        )
        .bind(index.workspace_id)
        .bind(&index.event_name)
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|(id,)| parse_ulid(id)).collect()
    }

    async fn read_block(&self, index: &Index, block_id: Ulid) -> Result<Block> {
        let path = Path::from(block_key(index, block_id));
        let bytes = self.bucket.get(&path).await?.bytes().await?;
        let block = serializer::deserialize(&bytes)?;

        if block.id != block_id {
            return Err(PauseError::Integrity(format!(
                "block '{}' stored under key for '{}'",
                block.id, block_id
            )));
        }
        Ok(block)
    }

    async fn deleted_ids(&self, _index: &Index, block_id: Ulid) -> Result<HashSet<Uuid>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT pause_id FROM pause_block_deletes WHERE block_id = ?")
                .bind(block_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn last_block_metadata(&self, index: &Index) -> Result<Option<BlockMetadata>> {
        let row = sqlx::query_as::<_, BlockRow>(
            r#"
            SELECT block_id, earliest_ms, latest_ms, first_pause_id, last_pause_id, len
            FROM pause_blocks
            WHERE workspace_id = ? AND event_name = ?
            ORDER BY latest_ms DESC, block_id DESC
            LIMIT 1
            "#,
        )
        .bind(index.workspace_id)
        .bind(&index.event_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BlockMetadata::try_from).transpose()
    }

    async fn block_metadata(&self, index: &Index) -> Result<Vec<BlockMetadata>> {
        let rows = sqlx::query_as::<_, BlockRow>(
            r#"
            SELECT block_id, earliest_ms, latest_ms, first_pause_id, last_pause_id, len
            FROM pause_blocks
            WHERE workspace_id = ? AND event_name = ?
            ORDER BY latest_ms ASC, block_id ASC
            "#,
        )
        .bind(index.workspace_id)
        .bind(&index.event_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BlockMetadata::try_from).collect()
    }

    async fn index_exists(&self, index: &Index) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pause_blocks WHERE workspace_id = ? AND event_name = ?",
        )
        .bind(index.workspace_id)
        .bind(&index.event_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn block_pause_ids(&self, _index: &Index, block_id: Ulid) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT pause_id FROM pause_block_index WHERE block_id = ? ORDER BY pause_id",
        )
        .bind(block_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn pause_by_id(&self, index: &Index, pause_id: Uuid) -> Result<Pause> {
        let Some(block_id) = self
            .containing_block(index.workspace_id, &index.event_name, pause_id)
            .await?
        else {
            return Err(PauseError::PauseNotFound(pause_id));
        };

        let block_index = if index.event_name.is_empty() {
            // The caller may not know the event; the block does.
            let (event_name,): (String,) =
                sqlx::query_as("SELECT event_name FROM pause_blocks WHERE block_id = ?")
                    .bind(block_id.to_string())
                    .fetch_one(&self.pool)
                    .await?;
            Index::new(index.workspace_id, event_name)
        } else {
            index.clone()
        };

        if self.deleted_ids(&block_index, block_id).await?.contains(&pause_id) {
            return Err(PauseError::PauseNotFound(pause_id));
        }

        let block = self.read_block(&block_index, block_id).await?;
        block
            .pauses
            .into_iter()
            .find(|p| p.id == pause_id)
            .ok_or_else(|| {
                PauseError::Integrity(format!(
                    "pause '{pause_id}' indexed in block '{block_id}' but missing from its content"
                ))
            })
    }
}

#[async_trait]
impl BlockStore for Blockstore {
    async fn delete(&self, index: &Index, pause: &Pause) -> Result<()> {
        let Some(block_id) = self
            .containing_block(index.workspace_id, &index.event_name, pause.id)
            .await?
        else {
            debug!(pause_id = %pause.id, "Pause not found in any block");
            return Ok(());
        };

        mark_deleted(&self.pool, block_id, pause.id).await?;
        debug!(pause_id = %pause.id, block_id = %block_id, "Soft-deleted pause in block");
        Ok(())
    }

    async fn delete_by_id(&self, workspace_id: Uuid, pause_id: Uuid) -> Result<bool> {
        let Some(block_id) = self.containing_block(workspace_id, "", pause_id).await? else {
            return Ok(false);
        };

        mark_deleted(&self.pool, block_id, pause_id).await?;
        debug!(pause_id = %pause_id, block_id = %block_id, "Soft-deleted pause in block");
        Ok(true)
    }
}
