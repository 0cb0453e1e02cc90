//! Lifecycle events for tracked jobs.
//!
//! Events are recorded in the same transaction as the mutation they
//! describe, so the stream never disagrees with job state. Consumers poll
//! `Engine::events_since` with the last sequence number they saw; gaps
//! cannot occur because `seq` is assigned by the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Jid;

/// One recorded lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Put {
        jid: Jid,
        queue: String,
    },
    Popped {
        jid: Jid,
        queue: String,
        worker: String,
    },
    Stalled {
        jid: Jid,
        queue: String,
    },
    Completed {
        jid: Jid,
    },
    Failed {
        jid: Jid,
        group: String,
    },
    Canceled {
        jid: Jid,
    },
    Track {
        jid: Jid,
    },
    Untrack {
        jid: Jid,
    },
    /// An event whose JSON this build no longer understands. Kept raw so
    /// old databases stay readable.
    Unknown {
        raw: String,
    },
}

impl EventKind {
    /// The jid this event concerns, if any.
    pub fn jid(&self) -> Option<&Jid> {
        match self {
            EventKind::Put { jid, .. }
            | EventKind::Popped { jid, .. }
            | EventKind::Stalled { jid, .. }
            | EventKind::Completed { jid }
            | EventKind::Failed { jid, .. }
            | EventKind::Canceled { jid }
            | EventKind::Track { jid }
            | EventKind::Untrack { jid } => Some(jid),
            EventKind::Unknown { .. } => None,
        }
    }
}
