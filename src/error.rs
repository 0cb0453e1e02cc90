//! Error types for jobq.
//!
//! Every variant is returned, never raised mid-mutation: operations run in
//! one transaction, so an error means the state is exactly as it was before
//! the call.

use thiserror::Error;

use crate::model::{Jid, JobState};

#[derive(Debug, Error)]
pub enum Error {
    /// A job with this jid already exists and is not replaceable.
    #[error("job already exists: {0}")]
    DuplicateJob(Jid),

    /// The caller's lease on this job is no longer valid. The dominant
    /// concurrency error: the job stalled and was reclaimed, moved, or
    /// canceled while the worker was running it.
    #[error("worker {worker} no longer holds the lease on {jid}")]
    LostLock { jid: Jid, worker: String },

    /// Cancel refused while other jobs still depend on this one.
    #[error("job {jid} has {count} unresolved dependents")]
    DependentJobs { jid: Jid, count: usize },

    #[error("job not found: {0}")]
    UnknownJob(Jid),

    #[error("queue not found: {0}")]
    UnknownQueue(String),

    /// Operation not valid from the job's current state.
    #[error("invalid transition for {jid}: {from} -> {to}")]
    InvalidTransition {
        jid: Jid,
        from: JobState,
        to: JobState,
    },

    #[error("recurring job not found: {0}")]
    UnknownRecurringJob(Jid),

    #[error("bad config value for {key}: {value}")]
    Config { key: String, value: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
