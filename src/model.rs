//! Core data model.
//!
//! A job is a unit of work with identity (jid), a home queue, an opaque
//! payload, priority, retry budget, and lifecycle state. Queues themselves
//! have no record of their own beyond a name; their waiting / scheduled /
//! running orderings are projections over job state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Jid
// ---------------------------------------------------------------------------

/// Unique job identifier. Callers may supply their own; generated ones are
/// hex-form v4 UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(pub String);

impl Jid {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Jid for the `n`th instance spawned from a recurring template.
    pub fn spawned(template: &Jid, n: u64) -> Self {
        Self(format!("{}-{}", template.0, n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Jid {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Jid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for popping, ordered by priority then insertion sequence.
    Waiting,
    /// Not eligible until its ready time passes.
    Scheduled,
    /// Blocked on unresolved dependencies.
    Depends,
    /// Leased to a worker.
    Running,
    /// Lease expired before completion or heartbeat.
    Stalled,
    /// Done successfully. Terminal.
    Completed,
    /// Failed without retry, or exhausted retries. Terminal until retried.
    Failed,
    /// Withdrawn. Terminal.
    Canceled,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Waiting, Running)
                | (Waiting, Canceled)
                | (Scheduled, Waiting)      // ready time reached
                | (Scheduled, Canceled)
                | (Depends, Waiting)        // all prerequisites completed
                | (Depends, Scheduled)      // released but still delayed
                | (Depends, Canceled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Waiting)        // advanced to a next queue, or retried
                | (Running, Scheduled)      // advanced or retried with a delay
                | (Running, Stalled)
                | (Running, Canceled)
                | (Stalled, Waiting)        // dropped: retry at original priority
                | (Stalled, Failed)         // retries exhausted
                | (Completed, Canceled)     // operator removal of a finished record
                | (Failed, Waiting)         // retried / unfailed by an operator
                | (Failed, Scheduled)
                | (Failed, Canceled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Scheduled => "scheduled",
            JobState::Depends => "depends",
            JobState::Running => "running",
            JobState::Stalled => "stalled",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "scheduled" => Ok(JobState::Scheduled),
            "depends" => Ok(JobState::Depends),
            "running" => Ok(JobState::Running),
            "stalled" => Ok(JobState::Stalled),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "canceled" => Ok(JobState::Canceled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Snapshot of a job. Reads return owned copies; mutation goes through the
/// engine only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub jid: Jid,

    /// Current queue, or None once completed / canceled.
    pub queue: Option<String>,

    /// Opaque payload. The engine never interprets it.
    pub data: serde_json::Value,

    /// Higher = popped sooner. Ties break by insertion sequence.
    pub priority: i64,

    pub state: JobState,

    pub tags: Vec<String>,

    /// Worker holding the lease while running.
    pub worker: Option<String>,

    /// Lease expiry while running.
    pub expires_at: Option<DateTime<Utc>>,

    /// Retries left before a stall or retry turns into a failure.
    pub remaining: i64,

    /// Original retry budget; `remaining` resets to this on queue advance.
    pub retries: i64,

    /// When a scheduled job becomes eligible.
    pub ready_at: Option<DateTime<Utc>>,

    /// Jids this job still waits on.
    pub depends_on: Vec<Jid>,

    /// Jids waiting on this job.
    pub dependents: Vec<Jid>,

    /// Emit lifecycle events for this job.
    pub tracked: bool,

    /// Present while failed.
    pub failure: Option<Failure>,

    /// One entry per queue cycle.
    pub history: Vec<HistoryCycle>,

    /// Template jid if this instance was spawned by the recurrence engine.
    pub spawned_from: Option<Jid>,

    pub created_at: DateTime<Utc>,
}

/// One put→pop→done cycle in a job's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryCycle {
    pub queue: String,
    pub put: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popped: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

/// Recorded when a job fails, kept until the job leaves `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    /// Failure kind, e.g. "invalid-input" or the reserved
    /// "failed-retries-<queue>".
    pub group: String,
    pub message: String,
    pub worker: Option<String>,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Recurring templates
// ---------------------------------------------------------------------------

/// A standing template that spawns job instances at a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringJob {
    pub jid: Jid,
    pub queue: String,
    pub data: serde_json::Value,
    pub priority: i64,
    /// Spawn interval in seconds.
    pub interval: i64,
    /// Absolute time of the next spawn.
    pub next_at: DateTime<Utc>,
    pub tags: Vec<String>,
    /// Retry budget assigned to spawned instances.
    pub retries: i64,
    /// Instances spawned so far.
    pub spawned: u64,
}

// ---------------------------------------------------------------------------
// Queue counts
// ---------------------------------------------------------------------------

/// Gauge counts for one queue at a point in time. `stalled` counts running
/// jobs whose lease has already expired but which no one has reclaimed yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCounts {
    pub name: String,
    pub waiting: u64,
    pub scheduled: u64,
    pub running: u64,
    pub stalled: u64,
    pub depends: u64,
    pub recurring: u64,
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Builder for `Engine::put`.
pub struct PutRequest {
    pub(crate) queue: String,
    pub(crate) jid: Option<Jid>,
    pub(crate) data: serde_json::Value,
    pub(crate) priority: i64,
    pub(crate) tags: Vec<String>,
    pub(crate) retries: i64,
    pub(crate) delay: i64,
    pub(crate) depends: Vec<Jid>,
}

impl PutRequest {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            jid: None,
            data: serde_json::Value::Null,
            priority: 0,
            tags: Vec::new(),
            retries: 5,
            delay: 0,
            depends: Vec::new(),
        }
    }

    /// Use a caller-chosen jid instead of a generated one.
    pub fn jid(mut self, jid: impl Into<Jid>) -> Self {
        self.jid = Some(jid.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn retries(mut self, retries: i64) -> Self {
        self.retries = retries;
        self
    }

    /// Seconds before the job becomes eligible.
    pub fn delay(mut self, seconds: i64) -> Self {
        self.delay = seconds;
        self
    }

    /// Jids that must complete before this job can be popped.
    pub fn depends(mut self, depends: Vec<Jid>) -> Self {
        self.depends = depends;
        self
    }
}

/// Builder for `Engine::recur`.
pub struct RecurRequest {
    pub(crate) queue: String,
    pub(crate) jid: Option<Jid>,
    pub(crate) data: serde_json::Value,
    pub(crate) interval: i64,
    pub(crate) offset: i64,
    pub(crate) priority: i64,
    pub(crate) tags: Vec<String>,
    pub(crate) retries: i64,
}

impl RecurRequest {
    pub fn new(queue: impl Into<String>, interval_seconds: i64) -> Self {
        Self {
            queue: queue.into(),
            jid: None,
            data: serde_json::Value::Null,
            interval: interval_seconds.max(1),
            offset: 0,
            priority: 0,
            tags: Vec::new(),
            retries: 5,
        }
    }

    pub fn jid(mut self, jid: impl Into<Jid>) -> Self {
        self.jid = Some(jid.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Seconds from now until the first spawn is due.
    pub fn offset(mut self, seconds: i64) -> Self {
        self.offset = seconds;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn retries(mut self, retries: i64) -> Self {
        self.retries = retries;
        self
    }
}
