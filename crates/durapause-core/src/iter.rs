// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pull-based pause iteration.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::PauseError;
use crate::pause::Pause;

/// A pause-at-a-time stream.
///
/// Callers loop on [`next`](PauseIterator::next) and read each pause with
/// [`val`](PauseIterator::val). Once `next` returns false, [`error`](PauseIterator::error)
/// must be checked: a failed iteration never looks like a short one.
#[async_trait]
pub trait PauseIterator: Send {
    /// Point-in-time estimate of how many pauses this iterator yields.
    fn count(&self) -> usize;

    /// Advance to the next pause. Returns false once exhausted or failed.
    async fn next(&mut self) -> bool;

    /// The current pause, if `next` has returned true.
    fn val(&self) -> Option<&Pause>;

    /// The error that ended iteration, if any.
    fn error(&self) -> Option<&PauseError>;
}

/// Iterator over pauses already held in memory.
pub struct VecIter {
    pauses: VecDeque<Pause>,
    current: Option<Pause>,
    count: usize,
}

impl VecIter {
    /// Create an iterator over the given pauses.
    pub fn new(pauses: Vec<Pause>) -> Self {
        Self {
            count: pauses.len(),
            pauses: pauses.into(),
            current: None,
        }
    }
}

#[async_trait]
impl PauseIterator for VecIter {
    fn count(&self) -> usize {
        self.count
    }

    async fn next(&mut self) -> bool {
        self.current = self.pauses.pop_front();
        self.current.is_some()
    }

    fn val(&self) -> Option<&Pause> {
        self.current.as_ref()
    }

    fn error(&self) -> Option<&PauseError> {
        None
    }
}
