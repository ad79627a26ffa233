// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for durapause-core.
//!
//! Errors fall into four groups, and callers are expected to branch on them
//! rather than on message text:
//!
//! | Group | Variants | Handling |
//! |-------|----------|----------|
//! | Contention | `AlreadyLeased`, `LeaseRejected` | Back off, retry later or skip the cycle |
//! | Not found | `NotInBuffer`, `PauseNotFound` | Fall back to the block layer; never logged as failure |
//! | Integrity | `Integrity`, `UnknownEncoding`, `IndexMismatch` | Surfaced to the operator, never retried blindly |
//! | Transient I/O | `Database`, `BlobStore`, `Io`, `Task` | Retryable at the caller's discretion |

use thiserror::Error;
use uuid::Uuid;

use crate::pause::Index;

/// Result type using [`PauseError`].
pub type Result<T> = std::result::Result<T, PauseError>;

/// Errors returned by pause store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PauseError {
    /// Another worker holds an unexpired lease for this index.
    #[error("index '{0}' is already leased")]
    AlreadyLeased(Index),

    /// The presented lease is not the current lease, and the current lease has not expired.
    #[error("lease renewal rejected for index '{0}'")]
    LeaseRejected(Index),

    /// The pause is not in the buffer; it has most likely been flushed to a block.
    #[error("pause '{0}' not in buffer")]
    NotInBuffer(Uuid),

    /// The pause could not be found in any layer.
    #[error("pause '{0}' not found")]
    PauseNotFound(Uuid),

    /// A pause was written against an index it does not belong to.
    #[error("pause '{pause_id}' belongs to index '{actual}', not '{expected}'")]
    IndexMismatch {
        /// The pause that was rejected.
        pause_id: Uuid,
        /// The index the write targeted.
        expected: Index,
        /// The index derived from the pause itself.
        actual: Index,
    },

    /// Stored content is inconsistent with its metadata.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// A block was encoded with a format tag this build does not understand.
    #[error("unknown block encoding 0x{0:02x}")]
    UnknownEncoding(u8),

    /// The backing key-value store failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The blob store failed.
    #[error("blob store error: {0}")]
    BlobStore(#[from] object_store::Error),

    /// Local filesystem access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),

    /// Configuration loading failed.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl PauseError {
    /// Machine-readable error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyLeased(_) => "ALREADY_LEASED",
            Self::LeaseRejected(_) => "LEASE_REJECTED",
            Self::NotInBuffer(_) => "NOT_IN_BUFFER",
            Self::PauseNotFound(_) => "PAUSE_NOT_FOUND",
            Self::IndexMismatch { .. } => "INDEX_MISMATCH",
            Self::Integrity(_) => "INTEGRITY_ERROR",
            Self::UnknownEncoding(_) => "UNKNOWN_ENCODING",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::BlobStore(_) => "BLOB_STORE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Task(_) => "TASK_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Lease contention, expected when several workers flush the same index.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::AlreadyLeased(_) | Self::LeaseRejected(_))
    }

    /// Whether a caller may retry the operation after backing off.
    ///
    /// Integrity errors are deliberately excluded: retrying them may reorder
    /// or duplicate pauses.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AlreadyLeased(_) | Self::LeaseRejected(_) => true,
            Self::Database(_) | Self::BlobStore(_) | Self::Io(_) | Self::Task(_) => true,
            _ => false,
        }
    }

    /// Whether this is the "already flushed, retry at the block layer" signal.
    pub fn is_not_in_buffer(&self) -> bool {
        matches!(self, Self::NotInBuffer(_))
    }
}
