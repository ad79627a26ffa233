// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durapause Core - Pause Store for Durable Step Functions
//!
//! A pause records that a run is suspended until an event arrives, a timeout
//! fires, or a sibling invocation resolves it. Keeping every pause of a busy
//! event in one live list does not scale, so pauses live in two layers:
//!
//! - a fast, mutable **buffer** holding recent pauses, and
//! - immutable **blocks** of older pauses, written to blob storage.
//!
//! A flush moves the oldest buffered pauses of an index into a block under a
//! lease, so only one worker writes blocks for an index at a time. Reads merge
//! both layers through a concurrent iterator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Execution Engine                                │
//! │            write / pauses_since / consume_pause / delete                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Manager                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │ write, delete            │ enqueue(index)             │ pauses_since
//!        ▼                          ▼                            ▼
//! ┌──────────────┐        ┌───────────────────┐        ┌───────────────────┐
//! │   Bufferer   │        │ BlockFlushEnqueuer│        │     DualIter      │
//! │   (SQLite)   │        │ in-process / queue│        │ buffer + blocks   │
//! └──────────────┘        └─────────┬─────────┘        └─────────┬─────────┘
//!        ▲                          │ flush_index_block          │ read_block
//!        │ drain                    ▼                            │
//!        │                ┌───────────────────┐                  │
//!        └────────────────│    Blockstore     │◄─────────────────┘
//!                         │  + BlockLeaser    │
//!                         └─────────┬─────────┘
//!                                   │
//!                   ┌───────────────┴───────────────┐
//!                   ▼                               ▼
//!          ┌────────────────┐             ┌──────────────────┐
//!          │  object_store  │             │  block metadata  │
//!          │ pauses/{ws}/.. │             │ + delete markers │
//!          └────────────────┘             └──────────────────┘
//! ```
//!
//! # Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | A written pause is durable | `Bufferer::write` commits before returning |
//! | One flusher per index | Lease compare-and-set in a single SQL statement |
//! | No partial blocks | A flush aborts unless a full block of pauses is available |
//! | Idempotent re-flush | Block IDs are derived from block content |
//! | No silent truncation | A failed block fetch ends iteration with an error |
//! | Each pause yielded once | Iterators deduplicate by ID and relist blocks after the buffer |
//! | Flush cleanup completes | Block commit and buffer removal run detached from the flush |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DURAPAUSE_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `DURAPAUSE_BLOB_DIR` | No | in-memory | Directory for block blobs |
//! | `DURAPAUSE_BLOCK_SIZE` | No | `25000` | Pauses per block |
//! | `DURAPAUSE_FLUSH_DELAY_MS` | No | `10000` | Delay before each flush |
//! | `DURAPAUSE_LEASE_DURATION_MS` | No | `30000` | Flush lease duration |
//! | `DURAPAUSE_LEASE_RENEW_INTERVAL_MS` | No | `10000` | Lease renewal interval |
//! | `DURAPAUSE_FETCH_CONCURRENCY` | No | `20` | Concurrent block fetches per iterator |
//!
//! # Modules
//!
//! - [`pause`]: Pause records and indexes
//! - [`buffer`]: The mutable buffer
//! - [`leaser`]: Flush leases
//! - [`block`] and [`serializer`]: Blocks and their wire format
//! - [`blockstore`]: Flushing and reading blocks
//! - [`dual_iter`]: Iteration across both layers
//! - [`manager`]: The facade tying it together
//! - [`flusher`]: Scheduling flushes off the write path

#![deny(missing_docs)]

/// Immutable blocks of flushed pauses and deterministic block IDs.
pub mod block;

/// Flushing buffered pauses into blocks and reading them back.
pub mod blockstore;

/// The mutable pause buffer.
pub mod buffer;

/// Configuration loaded from environment variables.
pub mod config;

/// Iteration across the buffer and historical blocks.
pub mod dual_iter;

/// Error types with machine-readable codes.
pub mod error;

/// Flush scheduling: in-process and queued.
pub mod flusher;

/// Pull-based pause iterators.
pub mod iter;

/// Renewable leases over an index.
pub mod leaser;

/// The pause store facade.
pub mod manager;

/// Embedded database migrations.
pub mod migrations;

/// Pause records and the index they belong to.
pub mod pause;

/// Block wire format.
pub mod serializer;

/// Wiring a store from configuration.
pub mod store;

/// Tracing subscriber setup.
pub mod telemetry;

pub use blockstore::{BlockFlusher, BlockReader, BlockStore, Blockstore, FlushOutcome};
pub use buffer::{Bufferer, Eviction, SqliteBufferer};
pub use config::Config;
pub use error::{PauseError, Result};
pub use iter::PauseIterator;
pub use leaser::{BlockLeaser, SqliteBlockLeaser};
pub use manager::{ConsumeResult, IndexStats, Manager};
pub use pause::{Index, Pause, RunIdentifier};
pub use store::PauseStore;
