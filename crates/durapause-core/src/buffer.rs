// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The mutable buffer holding pauses that have not been flushed to blocks.
//!
//! [`Bufferer`] is the durability point for pauses: a pause is saved once
//! [`Bufferer::write`] returns. [`SqliteBufferer`] is the SQLite-backed
//! implementation; pauses are ordered by their insertion time in
//! milliseconds, with the row sequence as a tiebreaker.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{PauseError, Result};
use crate::iter::PauseIterator;
use crate::pause::{Index, PAUSE_EXPIRY_GRACE, Pause};

/// Number of pauses loaded per page by buffer iterators.
pub const BUFFER_PAGE_SIZE: usize = 1_000;

/// A recorded consumption of a pause.
#[derive(Debug, Clone, PartialEq)]
pub struct Consumption {
    /// The consumed pause.
    pub pause_id: Uuid,
    /// Data recorded alongside the consumption, eg. the matching event.
    pub data: Option<Value>,
    /// When the pause was consumed.
    pub consumed_at: DateTime<Utc>,
}

/// Durable, low-latency store for pauses that have not yet been flushed.
#[async_trait]
pub trait Bufferer: Send + Sync {
    /// Append pauses to an index, returning the resulting buffer length.
    ///
    /// Every pause must belong to `index`. Writing a pause twice is a no-op.
    async fn write(&self, index: &Index, pauses: &[Pause]) -> Result<usize>;

    /// Iterate over pauses buffered at or after `since`; `None` returns everything.
    async fn pauses_since(
        &self,
        index: &Index,
        since: Option<DateTime<Utc>>,
    ) -> Result<Box<dyn PauseIterator>>;

    /// Load up to `limit` pauses buffered at or after `since`, ordered by
    /// insertion time, with `created_at` populated.
    async fn pauses_since_limit(
        &self,
        index: &Index,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Pause>>;

    /// Remove a pause, or fail with [`PauseError::NotInBuffer`] if it is not buffered.
    async fn delete(&self, index: &Index, pause: &Pause) -> Result<()>;

    /// Remove a pause by ID within a workspace, whatever its event.
    ///
    /// Returns false if no such pause is buffered.
    async fn delete_by_id(&self, workspace_id: Uuid, pause_id: Uuid) -> Result<bool>;

    /// The buffer insertion time of a pause.
    async fn pause_timestamp(&self, index: &Index, pause: &Pause) -> Result<DateTime<Utc>>;

    /// Number of pauses buffered for an index.
    async fn buffer_len(&self, index: &Index) -> Result<usize>;

    /// Whether any pauses are buffered for an index.
    async fn index_exists(&self, index: &Index) -> Result<bool> {
        Ok(self.buffer_len(index).await? > 0)
    }

    /// Load a buffered pause by ID. An empty event name matches any event.
    async fn pause_by_id(&self, index: &Index, pause_id: Uuid) -> Result<Pause>;

    /// Atomically record that a pause was consumed. First write wins: returns
    /// false if the pause had already been consumed.
    async fn consume(&self, pause_id: Uuid, data: Option<&Value>) -> Result<bool>;

    /// The recorded consumption of a pause, if any.
    async fn consumption(&self, pause_id: Uuid) -> Result<Option<Consumption>>;
}

/// SQLite-backed buffer.
#[derive(Clone)]
pub struct SqliteBufferer {
    pool: SqlitePool,
}

impl SqliteBufferer {
    /// Create a buffer over an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Remove pauses that expired more than [`PAUSE_EXPIRY_GRACE`] before
    /// `now`, and consumption markers older than the same grace.
    ///
    /// A consumed pause is gone from both layers, so once the grace has passed
    /// nothing can race its consumption any more.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> Result<Eviction> {
        let cutoff = now - PAUSE_EXPIRY_GRACE;
        let mut tx = self.pool.begin().await?;

        let pauses = sqlx::query("DELETE FROM pause_buffer WHERE expires_at_ms <= ?")
            .bind(cutoff.timestamp_millis())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let consumptions = sqlx::query("DELETE FROM pause_consumptions WHERE consumed_at <= ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        let eviction = Eviction {
            pauses,
            consumptions,
        };
        if eviction != Eviction::default() {
            debug!(?eviction, "Evicted expired pause state");
        }
        Ok(eviction)
    }
}

/// Rows removed by [`SqliteBufferer::evict_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eviction {
    /// Expired pauses removed from the buffer.
    pub pauses: u64,
    /// Consumption markers removed.
    pub consumptions: u64,
}

/// Truncate to millisecond precision, the resolution pauses are ordered by.
fn to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

fn decode_pause(data: &str, created_at_ms: i64) -> Result<Pause> {
    let mut pause: Pause = serde_json::from_str(data)?;
    if pause.created_at.is_none() {
        pause.created_at = DateTime::from_timestamp_millis(created_at_ms);
    }
    Ok(pause)
}

#[async_trait]
impl Bufferer for SqliteBufferer {
    #[instrument(skip(self, pauses), fields(index = %index, count = pauses.len()))]
    async fn write(&self, index: &Index, pauses: &[Pause]) -> Result<usize> {
        for pause in pauses {
            let actual = pause.index();
            if &actual != index {
                return Err(PauseError::IndexMismatch {
                    pause_id: pause.id,
                    expected: index.clone(),
                    actual,
                });
            }
        }

        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        for pause in pauses {
            let mut pause = pause.clone();
            let created_at = to_millis(pause.created_at.unwrap_or(now));
            pause.created_at = Some(created_at);
            let data = serde_json::to_string(&pause)?;

            sqlx::query(
                r#"
                INSERT INTO pause_buffer
                    (workspace_id, event_name, pause_id, created_at_ms, expires_at_ms, data)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (workspace_id, event_name, pause_id) DO NOTHING
                "#,
            )
            .bind(index.workspace_id)
            .bind(&index.event_name)
            .bind(pause.id)
            .bind(created_at.timestamp_millis())
            .bind(pause.expires.timestamp_millis())
            .bind(data)
            .execute(&mut *tx)
            .await?;
        }

        let (len,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pause_buffer WHERE workspace_id = ? AND event_name = ?",
        )
        .bind(index.workspace_id)
        .bind(&index.event_name)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(buffer_len = len, "Wrote pauses to buffer");
        Ok(len as usize)
    }

    async fn pauses_since(
        &self,
        index: &Index,
        since: Option<DateTime<Utc>>,
    ) -> Result<Box<dyn PauseIterator>> {
        let since_ms = since.map(|s| s.timestamp_millis()).unwrap_or(i64::MIN);

        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM pause_buffer
            WHERE workspace_id = ? AND event_name = ? AND created_at_ms >= ?
            "#,
        )
        .bind(index.workspace_id)
        .bind(&index.event_name)
        .bind(since_ms)
        .fetch_one(&self.pool)
        .await?;

        Ok(Box::new(SqliteBufferIter {
            pool: self.pool.clone(),
            index: index.clone(),
            cursor: (since_ms, i64::MIN),
            page: VecDeque::new(),
            exhausted: false,
            current: None,
            count: count as usize,
            err: None,
        }))
    }

    async fn pauses_since_limit(
        &self,
        index: &Index,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Pause>> {
        let since_ms = since.map(|s| s.timestamp_millis()).unwrap_or(i64::MIN);

        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT created_at_ms, data FROM pause_buffer
            WHERE workspace_id = ? AND event_name = ? AND created_at_ms >= ?
            ORDER BY created_at_ms ASC, seq ASC
            LIMIT ?
            "#,
        )
        .bind(index.workspace_id)
        .bind(&index.event_name)
        .bind(since_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|(created_at_ms, data)| decode_pause(data, *created_at_ms))
            .collect()
    }

    async fn delete(&self, index: &Index, pause: &Pause) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM pause_buffer WHERE workspace_id = ? AND event_name = ? AND pause_id = ?",
        )
        .bind(index.workspace_id)
        .bind(&index.event_name)
        .bind(pause.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PauseError::NotInBuffer(pause.id));
        }
        Ok(())
    }

    async fn delete_by_id(&self, workspace_id: Uuid, pause_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pause_buffer WHERE workspace_id = ? AND pause_id = ?")
            .bind(workspace_id)
            .bind(pause_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn pause_timestamp(&self, index: &Index, pause: &Pause) -> Result<DateTime<Utc>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT created_at_ms FROM pause_buffer
            WHERE workspace_id = ? AND event_name = ? AND pause_id = ?
            "#,
        )
        .bind(index.workspace_id)
        .bind(&index.event_name)
        .bind(pause.id)
        .fetch_optional(&self.pool)
        .await?;

        row.and_then(|(ms,)| DateTime::from_timestamp_millis(ms))
            .ok_or(PauseError::PauseNotFound(pause.id))
    }

    async fn buffer_len(&self, index: &Index) -> Result<usize> {
        let (len,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pause_buffer WHERE workspace_id = ? AND event_name = ?",
        )
        .bind(index.workspace_id)
        .bind(&index.event_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(len as usize)
    }

    async fn pause_by_id(&self, index: &Index, pause_id: Uuid) -> Result<Pause> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT created_at_ms, data FROM pause_buffer
            WHERE workspace_id = ?1 AND pause_id = ?2 AND (?3 = '' OR event_name = ?3)
            "#,
        )
        .bind(index.workspace_id)
        .bind(pause_id)
        .bind(&index.event_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((created_at_ms, data)) => decode_pause(&data, created_at_ms),
            None => Err(PauseError::PauseNotFound(pause_id)),
        }
    }

    async fn consume(&self, pause_id: Uuid, data: Option<&Value>) -> Result<bool> {
        let data = data.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"
            INSERT INTO pause_consumptions (pause_id, data, consumed_at)
            VALUES (?, ?, ?)
            ON CONFLICT (pause_id) DO NOTHING
            "#,
        )
        .bind(pause_id)
        .bind(data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn consumption(&self, pause_id: Uuid) -> Result<Option<Consumption>> {
        let row: Option<(Option<String>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT data, consumed_at FROM pause_consumptions WHERE pause_id = ?",
        )
        .bind(pause_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((data, consumed_at)) = row else {
            return Ok(None);
        };

        Ok(Some(Consumption {
            pause_id,
            data: data.as_deref().map(serde_json::from_str::<Value>).transpose()?,
            consumed_at,
        }))
    }
}

/// Pages through buffered pauses with a keyset cursor on `(created_at_ms, seq)`.
///
/// Pages are loaded lazily, so pauses written after the iterator was created
/// may also be returned.
struct SqliteBufferIter {
    pool: SqlitePool,
    index: Index,
    cursor: (i64, i64),
    page: VecDeque<(i64, i64, String)>,
    exhausted: bool,
    current: Option<Pause>,
    count: usize,
    err: Option<PauseError>,
}

impl SqliteBufferIter {
    async fn load_page(&mut self) -> Result<()> {
        let (ms, seq) = self.cursor;
        let rows: Vec<(i64, i64, String)> = sqlx::query_as(
            r#"
            SELECT created_at_ms, seq, data FROM pause_buffer
            WHERE workspace_id = ?1 AND event_name = ?2
              AND (created_at_ms > ?3 OR (created_at_ms = ?3 AND seq > ?4))
            ORDER BY created_at_ms ASC, seq ASC
            LIMIT ?5
            "#,
        )
        .bind(self.index.workspace_id)
        .bind(&self.index.event_name)
        .bind(ms)
        .bind(seq)
        .bind(BUFFER_PAGE_SIZE as i64)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() < BUFFER_PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some((ms, seq, _)) = rows.last() {
            self.cursor = (*ms, *seq);
        }
        self.page.extend(rows);
        Ok(())
    }
}

#[async_trait]
impl PauseIterator for SqliteBufferIter {
    fn count(&self) -> usize {
        self.count
    }

    async fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }

        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.load_page().await {
                self.err = Some(e);
                self.current = None;
                return false;
            }
        }

        let Some((created_at_ms, _, data)) = self.page.pop_front() else {
            self.current = None;
            return false;
        };

        match decode_pause(&data, created_at_ms) {
            Ok(pause) => {
                self.current = Some(pause);
                true
            }
            Err(e) => {
                self.err = Some(e);
                self.current = None;
                false
            }
        }
    }

    fn val(&self) -> Option<&Pause> {
        self.current.as_ref()
    }

    fn error(&self) -> Option<&PauseError> {
        self.err.as_ref()
    }
}
