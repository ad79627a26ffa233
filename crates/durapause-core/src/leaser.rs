// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time-boxed, renewable leases over an index.
//!
//! A lease ID is a ULID whose timestamp component is the lease's expiry, so
//! the stored value alone says whether it is still valid. Acquisition and
//! renewal are a single conditional upsert executed by the store:
//!
//! ```text
//! stored = none                    -> write new lease
//! stored < ulid(now, 0)            -> expired, write new lease
//! stored == presented              -> renewal, write new lease
//! otherwise                        -> reject
//! ```
//!
//! Crockford base32 ULIDs compare lexicographically in timestamp order, which
//! lets SQLite evaluate the expiry check on the stored text directly.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::error::{PauseError, Result};
use crate::pause::Index;

/// Lease key prefix used for flush ownership.
pub const FLUSH_LEASE_PREFIX: &str = "flush";

/// Default lease duration.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Default interval between lease renewals.
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// Grants exclusive, renewable ownership of an index.
#[async_trait]
pub trait BlockLeaser: Send + Sync {
    /// Acquire a lease, failing with [`PauseError::AlreadyLeased`] if an
    /// unexpired lease is held.
    async fn lease(&self, index: &Index) -> Result<Ulid>;

    /// Replace `lease_id` with a fresh lease, failing with
    /// [`PauseError::LeaseRejected`] unless `lease_id` is current or the
    /// stored lease has expired.
    async fn renew(&self, index: &Index, lease_id: Ulid) -> Result<Ulid>;

    /// Release a lease. Revoking a lease that is no longer held is a no-op.
    async fn revoke(&self, index: &Index, lease_id: Ulid) -> Result<()>;
}

/// Lease store backed by the `pause_leases` table.
#[derive(Clone)]
pub struct SqliteBlockLeaser {
    pool: SqlitePool,
    prefix: String,
    duration: Duration,
}

impl SqliteBlockLeaser {
    /// Create a leaser whose keys are namespaced by `prefix`.
    pub fn new(pool: SqlitePool, prefix: impl Into<String>, duration: Duration) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            duration,
        }
    }

    /// The lease duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    fn key(&self, index: &Index) -> String {
        format!(
            "{}:{}:{}",
            self.prefix, index.workspace_id, index.event_name
        )
    }

    fn next_lease_id(&self) -> Ulid {
        let expiry_ms = Utc::now().timestamp_millis() as u64 + self.duration.as_millis() as u64;
        Ulid::from_parts(expiry_ms, Ulid::new().random())
    }

    /// Write `new` if the stored lease is missing, expired or equal to `presented`.
    async fn compare_and_set(&self, index: &Index, presented: Option<Ulid>, new: Ulid) -> Result<bool> {
        let now_floor = Ulid::from_parts(Utc::now().timestamp_millis() as u64, 0);

        let result = sqlx::query(
            r#"
            INSERT INTO pause_leases (lease_key, lease_id) VALUES (?1, ?2)
            ON CONFLICT (lease_key) DO UPDATE SET lease_id = excluded.lease_id
            WHERE pause_leases.lease_id < ?3 OR pause_leases.lease_id = ?4
            "#,
        )
        .bind(self.key(index))
        .bind(new.to_string())
        .bind(now_floor.to_string())
        .bind(presented.map(|id| id.to_string()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl BlockLeaser for SqliteBlockLeaser {
    async fn lease(&self, index: &Index) -> Result<Ulid> {
        let lease_id = self.next_lease_id();
        if !self.compare_and_set(index, None, lease_id).await? {
            return Err(PauseError::AlreadyLeased(index.clone()));
        }
        debug!(
            workspace_id = %index.workspace_id,
            event_name = %index.event_name,
            lease_id = %lease_id,
            "Lease acquired"
        );
        Ok(lease_id)
    }

    async fn renew(&self, index: &Index, lease_id: Ulid) -> Result<Ulid> {
        let next = self.next_lease_id();
        if !self.compare_and_set(index, Some(lease_id), next).await? {
            return Err(PauseError::LeaseRejected(index.clone()));
        }
        Ok(next)
    }

    async fn revoke(&self, index: &Index, lease_id: Ulid) -> Result<()> {
        sqlx::query("DELETE FROM pause_leases WHERE lease_key = ? AND lease_id = ?")
            .bind(self.key(index))
            .bind(lease_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Run `body` while holding a lease on `index`.
///
/// The lease is renewed every `renew_interval` alongside the body. If a renewal
/// fails the body is dropped mid-flight and the renewal error is returned; the
/// token handed to the body is cancelled first so spawned work stops too. If
/// `cancel` fires, the body is dropped and [`PauseError::Cancelled`] returned.
/// The latest lease is revoked before returning in every case.
pub async fn with_lease<F, Fut, T>(
    leaser: &dyn BlockLeaser,
    index: &Index,
    renew_interval: Duration,
    cancel: &CancellationToken,
    body: F,
) -> Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lease_id = leaser.lease(index).await?;
    let current = Mutex::new(lease_id);
    let scope = cancel.child_token();

    let result = {
        let renewal = async {
            let mut ticker = tokio::time::interval(renew_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let held = lock_copy(&current);
                match leaser.renew(index, held).await {
                    Ok(next) => set(&current, next),
                    Err(e) => return e,
                }
            }
        };
        let work = body(scope.clone());
        tokio::pin!(renewal);
        tokio::pin!(work);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                scope.cancel();
                Err(PauseError::Cancelled)
            }
            err = &mut renewal => {
                scope.cancel();
                warn!(
                    workspace_id = %index.workspace_id,
                    event_name = %index.event_name,
                    error = %err,
                    "Lease renewal failed, abandoning leased work"
                );
                Err(err)
            }
            res = &mut work => res,
        }
    };

    scope.cancel();
    let held = lock_copy(&current);
    if let Err(e) = leaser.revoke(index, held).await {
        warn!(
            workspace_id = %index.workspace_id,
            event_name = %index.event_name,
            error = %e,
            "Failed to revoke lease"
        );
    }

    result
}

fn lock_copy(current: &Mutex<Ulid>) -> Ulid {
    match current.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn set(current: &Mutex<Ulid>, next: Ulid) {
    match current.lock() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}
