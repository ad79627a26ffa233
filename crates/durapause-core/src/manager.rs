// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The pause store facade used by the execution engine.
//!
//! [`Manager`] writes through the buffer, schedules flushes when an index
//! outgrows a block, and reads and deletes across both layers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::blockstore::{BlockReader, BlockStore, FlushOutcome};
use crate::buffer::Bufferer;
use crate::dual_iter::{DualIter, DualIterOpts};
use crate::error::{PauseError, Result};
use crate::flusher::BlockFlushEnqueuer;
use crate::iter::PauseIterator;
use crate::pause::{Index, Pause, skip_flushing};

/// Default delay applied before flushing, absorbing clock skew between writers.
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_secs(10);

/// Result of consuming a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeResult {
    /// False if the pause had already been consumed by someone else.
    pub did_consume: bool,
}

/// Summary of one block of an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block ID.
    pub id: Ulid,
    /// Pauses written into the block.
    pub len: usize,
    /// Creation time of the earliest pause.
    pub first_timestamp: DateTime<Utc>,
    /// Creation time of the latest pause.
    pub last_timestamp: DateTime<Utc>,
    /// Pauses soft-deleted since the block was written.
    pub delete_count: usize,
}

/// Buffer and block statistics for an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    /// The index described.
    pub index: Index,
    /// Pauses currently buffered.
    pub buffer_len: usize,
    /// Blocks, oldest first.
    pub blocks: Vec<BlockInfo>,
}

/// Builder for a [`Manager`].
pub struct ManagerBuilder {
    buffer: Arc<dyn Bufferer>,
    blocks: Option<BlockLayer>,
    enqueuer: Option<Arc<dyn BlockFlushEnqueuer>>,
    flush_delay: Duration,
    iter_opts: DualIterOpts,
}

impl std::fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("blockstore", &self.blocks.as_ref().map(|_| "..."))
            .field("enqueuer", &self.enqueuer.as_ref().map(|_| "..."))
            .field("flush_delay", &self.flush_delay)
            .field("iter_opts", &self.iter_opts)
            .finish()
    }
}

impl ManagerBuilder {
    /// Start a builder over the given buffer.
    pub fn new(buffer: Arc<dyn Bufferer>) -> Self {
        Self {
            buffer,
            blocks: None,
            enqueuer: None,
            flush_delay: DEFAULT_FLUSH_DELAY,
            iter_opts: DualIterOpts::default(),
        }
    }

    /// Enable flushing to, and reading from, blocks.
    pub fn blockstore<B: BlockStore + 'static>(mut self, blockstore: Arc<B>) -> Self {
        self.blocks = Some(BlockLayer {
            reader: blockstore.clone(),
            store: blockstore,
        });
        self
    }

    /// Set where flush requests are sent once an index outgrows a block.
    pub fn enqueuer(mut self, enqueuer: Arc<dyn BlockFlushEnqueuer>) -> Self {
        self.enqueuer = Some(enqueuer);
        self
    }

    /// Set the delay applied before each flush.
    ///
    /// Default: 10 seconds
    pub fn flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    /// Set block fetch tuning for iterators.
    pub fn iter_opts(mut self, opts: DualIterOpts) -> Self {
        self.iter_opts = opts;
        self
    }

    /// Build the manager.
    pub fn build(self) -> Manager {
        Manager {
            buffer: self.buffer,
            blocks: self.blocks,
            enqueuer: self.enqueuer,
            flush_delay: self.flush_delay,
            iter_opts: self.iter_opts,
        }
    }
}

/// The block store, also held as a reader for iterators.
struct BlockLayer {
    store: Arc<dyn BlockStore>,
    reader: Arc<dyn BlockReader>,
}

/// Reads and writes pauses across the buffer and the block store.
pub struct Manager {
    buffer: Arc<dyn Bufferer>,
    blocks: Option<BlockLayer>,
    enqueuer: Option<Arc<dyn BlockFlushEnqueuer>>,
    flush_delay: Duration,
    iter_opts: DualIterOpts,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("blockstore", &self.blocks.is_some())
            .field("enqueuer", &self.enqueuer.is_some())
            .field("flush_delay", &self.flush_delay)
            .finish()
    }
}

impl Manager {
    /// Create a builder over the given buffer.
    pub fn builder(buffer: Arc<dyn Bufferer>) -> ManagerBuilder {
        ManagerBuilder::new(buffer)
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &Arc<dyn Bufferer> {
        &self.buffer
    }

    /// The block store, if block storage is enabled.
    pub fn blockstore(&self) -> Option<&Arc<dyn BlockStore>> {
        self.blocks.as_ref().map(|b| &b.store)
    }

    /// Write pauses to the buffer, returning the resulting buffer length.
    ///
    /// Once the buffer holds more than a block's worth of pauses a flush is
    /// requested. Failing to request one is logged and never fails the write.
    #[instrument(skip(self, pauses), fields(index = %index, count = pauses.len()))]
    pub async fn write(&self, index: &Index, pauses: &[Pause]) -> Result<usize> {
        let len = self.buffer.write(index, pauses).await?;

        let (Some(bs), Some(enqueuer)) = (self.blockstore(), &self.enqueuer) else {
            return Ok(len);
        };
        if skip_flushing(index, pauses) {
            return Ok(len);
        }

        if len > bs.block_size() {
            if let Err(e) = enqueuer.enqueue(index).await {
                error!(error = %e, buffer_len = len, "Failed to request block flush");
            }
        }

        Ok(len)
    }

    /// Iterate over every pause created at or after `since` across both layers.
    ///
    /// `None` reads everything. The iterator stops fetching blocks once
    /// `cancel` fires.
    pub async fn pauses_since(
        &self,
        index: &Index,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn PauseIterator>> {
        let buffered = self.buffer.pauses_since(index, since).await?;

        let Some(layer) = &self.blocks else {
            return Ok(buffered);
        };

        // Even with no blocks yet, one may be written while the buffer is read.
        let blocks = layer.reader.blocks_since(index, since).await?;
        Ok(Box::new(DualIter::new(
            index.clone(),
            since,
            buffered,
            layer.reader.clone(),
            blocks,
            self.iter_opts.clone(),
            cancel,
        )))
    }

    /// Flush one block for an index after the configured delay.
    pub async fn flush_index_block(
        &self,
        index: &Index,
        cancel: &CancellationToken,
    ) -> Result<FlushOutcome> {
        let Some(bs) = self.blockstore() else {
            return Ok(FlushOutcome::Skipped);
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(PauseError::Cancelled),
            _ = tokio::time::sleep(self.flush_delay) => {}
        }

        bs.flush_index_block(index, cancel).await
    }

    /// Mark a pause consumed and remove it.
    ///
    /// Consumption is first-write-wins: a second consume reports
    /// `did_consume: false`. The pause is removed in either case.
    #[instrument(skip(self, pause, data), fields(index = %index, pause_id = %pause.id))]
    pub async fn consume_pause(
        &self,
        index: &Index,
        pause: &Pause,
        data: Option<&Value>,
    ) -> Result<ConsumeResult> {
        let did_consume = self.buffer.consume(pause.id, data).await?;
        if !did_consume {
            debug!("Pause already consumed");
        }

        if let Err(e) = self.delete(index, pause).await {
            // The consume marker is what guards against double resumption.
            warn!(error = %e, "Failed to delete consumed pause");
        }

        Ok(ConsumeResult { did_consume })
    }

    /// Delete a pause from the buffer and soft-delete it in its block.
    ///
    /// A flushed pause may still be buffered if removing it after the flush
    /// failed, so both layers are always cleared.
    pub async fn delete(&self, index: &Index, pause: &Pause) -> Result<()> {
        match self.buffer.delete(index, pause).await {
            Ok(()) => {}
            Err(e) if e.is_not_in_buffer() => {
                debug!(pause_id = %pause.id, "Pause not in buffer");
            }
            Err(e) => return Err(e),
        }

        match self.blockstore() {
            Some(bs) => bs.delete(index, pause).await,
            None => Ok(()),
        }
    }

    /// Delete a pause knowing only its ID and workspace.
    ///
    /// Returns false if the pause was found in neither layer.
    #[instrument(skip(self))]
    pub async fn delete_by_id(&self, workspace_id: Uuid, pause_id: Uuid) -> Result<bool> {
        let buffered = self.buffer.delete_by_id(workspace_id, pause_id).await?;
        let flushed = match self.blockstore() {
            Some(bs) => bs.delete_by_id(workspace_id, pause_id).await?,
            None => false,
        };
        Ok(buffered || flushed)
    }

    /// Number of pauses buffered for an index.
    pub async fn buffer_len(&self, index: &Index) -> Result<usize> {
        self.buffer.buffer_len(index).await
    }

    /// Whether an index has pauses in the buffer or any blocks.
    pub async fn index_exists(&self, index: &Index) -> Result<bool> {
        if self.buffer.index_exists(index).await? {
            return Ok(true);
        }
        match self.blockstore() {
            Some(bs) => bs.index_exists(index).await,
            None => Ok(false),
        }
    }

    /// Whether an index is large enough to evaluate in aggregate: more than
    /// `min_len` pauses buffered, or any blocks written.
    pub async fn aggregated(&self, index: &Index, min_len: usize) -> Result<bool> {
        if self.buffer.buffer_len(index).await? > min_len {
            return Ok(true);
        }
        match self.blockstore() {
            Some(bs) => bs.index_exists(index).await,
            None => Ok(false),
        }
    }

    /// Load a pause by ID from the buffer, falling back to blocks.
    pub async fn pause_by_id(&self, index: &Index, pause_id: Uuid) -> Result<Pause> {
        match self.buffer.pause_by_id(index, pause_id).await {
            Err(PauseError::PauseNotFound(_)) => match self.blockstore() {
                Some(bs) => bs.pause_by_id(index, pause_id).await,
                None => Err(PauseError::PauseNotFound(pause_id)),
            },
            other => other,
        }
    }

    /// Buffer insertion time of a pause.
    pub async fn pause_timestamp(&self, index: &Index, pause: &Pause) -> Result<DateTime<Utc>> {
        self.buffer.pause_timestamp(index, pause).await
    }

    /// Buffer and block statistics for an index.
    pub async fn index_stats(&self, index: &Index) -> Result<IndexStats> {
        let buffer_len = self.buffer.buffer_len(index).await?;
        let mut blocks = Vec::new();

        if let Some(bs) = self.blockstore() {
            for md in bs.block_metadata(index).await? {
                let delete_count = match bs.deleted_ids(index, md.block_id).await {
                    Ok(ids) => ids.len(),
                    Err(e) => {
                        warn!(block_id = %md.block_id, error = %e, "Failed to count block deletes");
                        0
                    }
                };
                blocks.push(BlockInfo {
                    id: md.block_id,
                    len: md.len,
                    first_timestamp: md.first_timestamp(),
                    last_timestamp: md.last_timestamp(),
                    delete_count,
                });
            }
        }

        Ok(IndexStats {
            index: index.clone(),
            buffer_len,
            blocks,
        })
    }

    /// IDs of every pause written into a block.
    pub async fn block_pause_ids(&self, index: &Index, block_id: Ulid) -> Result<Vec<Uuid>> {
        match self.blockstore() {
            Some(bs) => bs.block_pause_ids(index, block_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// IDs of pauses soft-deleted within a block.
    pub async fn block_deleted_ids(&self, index: &Index, block_id: Ulid) -> Result<HashSet<Uuid>> {
        match self.blockstore() {
            Some(bs) => bs.deleted_ids(index, block_id).await,
            None => Ok(HashSet::new()),
        }
    }
}
