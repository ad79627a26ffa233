// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Immutable blocks of flushed pauses and their metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{PauseError, Result};
use crate::pause::{Index, Pause};

/// Default number of pauses stored in a single block.
pub const DEFAULT_BLOCK_SIZE: usize = 25_000;

/// A bounded batch of pauses written once to blob storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Time-sortable block ID. Its timestamp is the latest pause creation time.
    pub id: Ulid,
    /// The index every pause in this block belongs to.
    pub index: Index,
    /// Pauses ordered earliest to latest.
    pub pauses: Vec<Pause>,
}

/// Time range and size of a block at the time it was written.
///
/// Persisted separately from blob content so block enumeration never lists
/// the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMetadata {
    /// The block this metadata describes.
    pub block_id: Ulid,
    /// Creation time of the earliest pause, unix milliseconds.
    pub earliest_ms: i64,
    /// Creation time of the latest pause, unix milliseconds.
    pub latest_ms: i64,
    /// First pause ID in the block.
    pub first_pause_id: Uuid,
    /// Last pause ID in the block.
    pub last_pause_id: Uuid,
    /// Number of pauses in the block.
    pub len: usize,
}

impl BlockMetadata {
    /// Build metadata for a block whose pauses are sorted by creation time.
    ///
    /// Every pause must carry a creation timestamp; without it the block's
    /// position in time cannot be determined once the buffer copy is gone.
    pub fn for_pauses(pauses: &[Pause]) -> Result<Self> {
        let (Some(first), Some(last)) = (pauses.first(), pauses.last()) else {
            return Err(PauseError::Integrity("cannot describe an empty block".into()));
        };

        let earliest = first
            .created_at
            .ok_or_else(|| PauseError::Integrity("block earliest boundary is not set".into()))?;
        let latest = last
            .created_at
            .ok_or_else(|| PauseError::Integrity("block latest boundary is not set".into()))?;

        if latest < earliest {
            return Err(PauseError::Integrity(
                "block pauses are not ordered by creation time".into(),
            ));
        }

        Ok(Self {
            block_id: Ulid::nil(),
            earliest_ms: earliest.timestamp_millis(),
            latest_ms: latest.timestamp_millis(),
            first_pause_id: first.id,
            last_pause_id: last.id,
            len: pauses.len(),
        })
    }

    /// Creation time of the earliest pause.
    pub fn first_timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.earliest_ms).unwrap_or_default()
    }

    /// Creation time of the latest pause.
    pub fn last_timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.latest_ms).unwrap_or_default()
    }
}

/// Largest timestamp a ULID can carry.
const ULID_MAX_TIMESTAMP_MS: u64 = (1 << 48) - 1;

/// Derive a deterministic block ID from the block's pause set and time range.
///
/// The timestamp component is the latest pause time so IDs sort blocks
/// chronologically; the 80 random bits are taken from a SHA-256 digest over the
/// time range and every pause ID, so the same content always yields the same ID.
/// Fails if the latest pause time cannot be carried by a ULID.
pub fn block_id(pauses: &[Pause], metadata: &BlockMetadata) -> Result<Ulid> {
    let latest_ms = u64::try_from(metadata.latest_ms)
        .ok()
        .filter(|ms| *ms <= ULID_MAX_TIMESTAMP_MS)
        .ok_or_else(|| {
            PauseError::Integrity(format!(
                "block latest timestamp {} is outside the ULID range",
                metadata.latest_ms
            ))
        })?;

    let mut hasher = Sha256::new();
    hasher.update(metadata.earliest_ms.to_be_bytes());
    hasher.update(metadata.latest_ms.to_be_bytes());
    for pause in pauses {
        hasher.update(pause.id.as_bytes());
    }
    let digest = hasher.finalize();

    let mut entropy = [0u8; 16];
    entropy[6..].copy_from_slice(&digest[..10]);
    Ok(Ulid::from_parts(latest_ms, u128::from_be_bytes(entropy)))
}

/// Blob store key for a block.
pub fn block_key(index: &Index, block_id: Ulid) -> String {
    format!(
        "pauses/{}/{}/blk_{}",
        index.workspace_id, index.event_name, block_id
    )
}
