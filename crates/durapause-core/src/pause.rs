// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pause records and the index they are grouped under.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// How long a pause stays in the buffer after it expires.
///
/// Timeout handling needs to tell "expired, event never arrived" apart from
/// "already consumed", so expired pauses must remain readable for a while.
pub const PAUSE_EXPIRY_GRACE: Duration = Duration::minutes(10);

/// Identifies the suspended run a pause belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentifier {
    /// The run that is suspended.
    #[serde(rename = "runID")]
    pub run_id: Ulid,
    /// The function the run is executing.
    #[serde(rename = "wID")]
    pub function_id: Uuid,
    /// The account owning the run.
    #[serde(rename = "aID")]
    pub account_id: Uuid,
}

/// A durable record that a run is suspended until an event, a timeout, or a
/// sibling invocation resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pause {
    /// Globally unique pause ID.
    pub id: Uuid,
    /// Tenant scope of the pause.
    #[serde(rename = "wsID")]
    pub workspace_id: Uuid,
    /// The suspended execution.
    pub identifier: RunIdentifier,
    /// The step the pause departs from.
    pub outgoing: String,
    /// The step to resume into.
    pub incoming: String,
    /// When the pause becomes eligible for timeout handling.
    pub expires: DateTime<Utc>,
    /// Event name that can satisfy this pause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Boolean match expression evaluated against incoming events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Minimal precomputed context for evaluating `expression`, stored verbatim.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub expression_data: HashMap<String, serde_json::Value>,
    /// Correlation ID for invoke pauses. Such pauses are never flushed.
    #[serde(rename = "icID", default, skip_serializing_if = "Option::is_none")]
    pub invoke_correlation_id: Option<String>,
    /// Resume only when the pause times out without being consumed.
    #[serde(default, skip_serializing_if = "is_false")]
    pub on_timeout: bool,
    /// Name under which matched-event data is recorded into run state.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_key: String,
    /// Consuming this pause cancels the run instead of resuming it.
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancel: bool,
    /// Buffer insertion time. Set by the buffer on write when absent.
    #[serde(rename = "ca", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Pause {
    /// Create a pause for the given run, waiting on `event` until `expires`.
    pub fn new(
        workspace_id: Uuid,
        identifier: RunIdentifier,
        event: Option<String>,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            identifier,
            outgoing: String::new(),
            incoming: String::new(),
            expires,
            event,
            expression: None,
            expression_data: HashMap::new(),
            invoke_correlation_id: None,
            on_timeout: false,
            data_key: String::new(),
            cancel: false,
            created_at: None,
        }
    }

    /// The index this pause is stored under.
    pub fn index(&self) -> Index {
        Index::for_pause(self)
    }

    /// Whether the pause has passed its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }

    /// Whether the pause is past expiry plus [`PAUSE_EXPIRY_GRACE`] and may be evicted.
    pub fn is_evictable(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires + PAUSE_EXPIRY_GRACE
    }
}

/// Partition key for pauses: a tenant scope plus an event name.
///
/// A pause belongs to exactly one index, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Index {
    /// Tenant scope.
    #[serde(rename = "workspaceID")]
    pub workspace_id: Uuid,
    /// Event name. Empty for pauses that do not wait on an event.
    #[serde(rename = "eventName")]
    pub event_name: String,
}

impl Index {
    /// Create an index for a workspace and event name.
    pub fn new(workspace_id: Uuid, event_name: impl Into<String>) -> Self {
        Self {
            workspace_id,
            event_name: event_name.into(),
        }
    }

    /// Derive the index from a pause.
    pub fn for_pause(pause: &Pause) -> Self {
        Self {
            workspace_id: pause.workspace_id,
            event_name: pause.event.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workspace_id, self.event_name)
    }
}

/// Whether pauses for `index` must stay in the buffer instead of being flushed.
///
/// Pauses without an event are signals, and pauses with an invoke correlation ID
/// resolve invokes; both require O(1) lookups by ID that only the buffer serves.
pub fn skip_flushing(index: &Index, pauses: &[Pause]) -> bool {
    if index.event_name.is_empty() {
        return true;
    }
    pauses.iter().any(|p| p.invoke_correlation_id.is_some())
}
