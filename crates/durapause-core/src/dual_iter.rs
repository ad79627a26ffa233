// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Iteration over the buffer and historical blocks as one stream.
//!
//! The buffer is drained first. Blocks are fetched in the background, at most
//! `concurrency` at a time, and their pauses are handed out as fetches
//! complete, in completion order. There is no ordering across the two layers.
//!
//! A single failed fetch ends iteration for good: a silently missing block
//! could leave a waiting run unmatched.
//!
//! A flush may run while the buffer is being paged, moving pauses not yet
//! read into a new block. Blocks are listed again once the buffer is
//! exhausted, and each pause ID is yielded at most once, so pauses present in
//! both layers are neither lost nor repeated.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::blockstore::BlockReader;
use crate::error::{PauseError, Result};
use crate::iter::PauseIterator;
use crate::pause::{Index, Pause};

/// Default number of blocks fetched concurrently.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 20;

/// Default interval between checks on outstanding block fetches.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tuning for [`DualIter`].
#[derive(Debug, Clone)]
pub struct DualIterOpts {
    /// Maximum number of in-flight block fetches.
    pub concurrency: usize,
    /// How long `next` waits on fetches before re-checking.
    pub poll_interval: Duration,
}

impl Default for DualIterOpts {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_FETCH_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Merges a buffer iterator with pauses read from blocks.
pub struct DualIter {
    index: Index,
    since: Option<DateTime<Utc>>,
    reader: Arc<dyn BlockReader>,
    opts: DualIterOpts,

    buffer: Box<dyn PauseIterator>,
    buffer_done: bool,
    from_buffer: bool,

    unfetched: VecDeque<Ulid>,
    known: HashSet<Ulid>,
    relisted: bool,
    seen: HashSet<Uuid>,
    in_flight: JoinSet<Result<Vec<Pause>>>,
    ready: VecDeque<Pause>,

    current: Option<Pause>,
    count: usize,
    err: Option<PauseError>,
    cancel: CancellationToken,
}

impl DualIter {
    /// Create an iterator over `buffer` followed by `blocks`.
    ///
    /// Block pauses created before `since` are dropped. Fetches stop when
    /// `cancel` is cancelled or the iterator is dropped.
    pub fn new(
        index: Index,
        since: Option<DateTime<Utc>>,
        buffer: Box<dyn PauseIterator>,
        reader: Arc<dyn BlockReader>,
        blocks: Vec<Ulid>,
        opts: DualIterOpts,
        cancel: &CancellationToken,
    ) -> Self {
        let count = buffer.count() + blocks.len() * reader.block_size();
        Self {
            index,
            since,
            reader,
            opts,
            buffer,
            buffer_done: false,
            from_buffer: false,
            known: blocks.iter().copied().collect(),
            unfetched: blocks.into(),
            relisted: false,
            seen: HashSet::new(),
            in_flight: JoinSet::new(),
            ready: VecDeque::new(),
            current: None,
            count,
            err: None,
            cancel: cancel.child_token(),
        }
    }

    fn top_up(&mut self) {
        while self.in_flight.len() < self.opts.concurrency.max(1) {
            let Some(block_id) = self.unfetched.pop_front() else {
                break;
            };

            let reader = self.reader.clone();
            let index = self.index.clone();
            let since = self.since;
            let cancel = self.cancel.clone();
            self.in_flight.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(PauseError::Cancelled),
                    res = fetch_block(reader.as_ref(), &index, block_id, since) => res,
                }
            });
        }
    }

    /// Pick up blocks written since iteration started.
    async fn relist(&mut self) -> Result<()> {
        self.relisted = true;
        let blocks = self.reader.blocks_since(&self.index, self.since).await?;
        let before = self.unfetched.len();
        for block_id in blocks {
            if self.known.insert(block_id) {
                self.unfetched.push_back(block_id);
            }
        }

        let added = self.unfetched.len() - before;
        if added > 0 {
            debug!(
                workspace_id = %self.index.workspace_id,
                event_name = %self.index.event_name,
                added,
                "Blocks written during iteration"
            );
            self.count += added * self.reader.block_size();
        }
        Ok(())
    }

    fn fail(&mut self, err: PauseError) {
        warn!(
            workspace_id = %self.index.workspace_id,
            event_name = %self.index.event_name,
            error = %err,
            "Pause iteration failed"
        );
        self.err = Some(err);
        self.current = None;
        self.unfetched.clear();
        self.ready.clear();
        self.in_flight.abort_all();
        self.cancel.cancel();
    }
}

async fn fetch_block(
    reader: &dyn BlockReader,
    index: &Index,
    block_id: Ulid,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<Pause>> {
    let (block, deleted) = tokio::try_join!(
        reader.read_block(index, block_id),
        reader.deleted_ids(index, block_id),
    )?;

    Ok(block
        .pauses
        .into_iter()
        .filter(|p| !deleted.contains(&p.id))
        .filter(|p| match (since, p.created_at) {
            (Some(since), Some(created_at)) => created_at >= since,
            _ => true,
        })
        .collect())
}

#[async_trait]
impl PauseIterator for DualIter {
    fn count(&self) -> usize {
        self.count
    }

    async fn next(&mut self) -> bool {
        if self.err.is_some() || self.buffer.error().is_some() {
            return false;
        }
        if self.cancel.is_cancelled() {
            self.fail(PauseError::Cancelled);
            return false;
        }

        self.top_up();

        if !self.buffer_done {
            while self.buffer.next().await {
                let Some(id) = self.buffer.val().map(|p| p.id) else {
                    continue;
                };
                if self.seen.insert(id) {
                    self.from_buffer = true;
                    return true;
                }
            }
            self.buffer_done = true;
            if self.buffer.error().is_some() {
                // Reported through `error()`; stop fetching blocks.
                self.current = None;
                self.in_flight.abort_all();
                self.cancel.cancel();
                return false;
            }
        }
        self.from_buffer = false;

        if !self.relisted
            && let Err(e) = self.relist().await
        {
            self.fail(e);
            return false;
        }

        loop {
            if let Some(pause) = self.ready.pop_front() {
                // Still in the buffer when its block was written.
                if !self.seen.insert(pause.id) {
                    continue;
                }
                self.current = Some(pause);
                return true;
            }

            self.top_up();
            if self.in_flight.is_empty() {
                self.current = None;
                return false;
            }

            let cancel = self.cancel.clone();
            let poll = self.opts.poll_interval;
            let joined = tokio::select! {
                _ = cancel.cancelled() => None,
                res = tokio::time::timeout(poll, self.in_flight.join_next()) => Some(res),
            };

            match joined {
                None => {
                    self.fail(PauseError::Cancelled);
                    return false;
                }
                // Nothing finished yet; check again.
                Some(Err(_)) | Some(Ok(None)) => continue,
                Some(Ok(Some(Ok(Ok(pauses))))) => self.ready.extend(pauses),
                Some(Ok(Some(Ok(Err(e))))) => {
                    self.fail(e);
                    return false;
                }
                Some(Ok(Some(Err(join_err)))) => {
                    self.fail(PauseError::Task(join_err.to_string()));
                    return false;
                }
            }
        }
    }

    fn val(&self) -> Option<&Pause> {
        if self.from_buffer {
            self.buffer.val()
        } else {
            self.current.as_ref()
        }
    }

    fn error(&self) -> Option<&PauseError> {
        self.err.as_ref().or_else(|| self.buffer.error())
    }
}

impl Drop for DualIter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
