//! # jobq
//!
//! Embedded job-queue engine. Jobs move through named queues as an atomic
//! state machine: put, pop under a lease, heartbeat, complete, fail, retry,
//! cancel, with scheduled delays, inter-job dependencies, recurring
//! templates, tags, and per-day wait/run statistics.
//!
//! Every operation executes as a single SQLite transaction, so concurrent
//! workers never observe a partial effect and an error implies no effect
//! at all. The engine has no threads of its own; stalled-lease recovery and
//! recurring-job spawning happen inside `pop`/`peek` or an explicit tick.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod stats;
pub mod storage;

pub use config::Defaults;
pub use engine::Engine;
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use model::{Jid, Job, JobState, PutRequest, RecurRequest, RecurringJob};
