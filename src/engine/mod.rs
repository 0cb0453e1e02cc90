//! Core engine. The public API for every queue operation.
//!
//! The engine owns the storage and enforces all invariants. Each operation
//! runs inside a single storage transaction: callers either see its whole
//! effect or none of it. Maintenance (ready promotion, stall recovery,
//! recurring spawns, terminal retention) piggybacks on `pop`/`peek` rather
//! than running on a timer — staleness is discovered when someone looks.

pub mod admin;
pub mod maintenance;
pub mod recur;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::{Defaults, keys, parse_int};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::*;
use crate::stats::{QueueStats, day_of};
use crate::storage::{Storage, TxContext};

/// The job-queue engine. Owns all state and enforces all invariants.
pub struct Engine {
    pub(crate) storage: Storage,
    pub(crate) defaults: Defaults,
}

/// Where `complete` sends a job next, instead of finishing it.
#[derive(Debug, Clone)]
pub struct Advance {
    pub queue: String,
    /// Seconds before the job is eligible in the next queue.
    pub delay: i64,
}

impl Advance {
    pub fn to(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            delay: 0,
        }
    }

    pub fn delay(mut self, seconds: i64) -> Self {
        self.delay = seconds;
        self
    }
}

impl Engine {
    /// Create an engine with in-memory storage.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            storage: Storage::in_memory()?,
            defaults: Defaults::default(),
        })
    }

    /// Create an engine backed by a database file.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            storage: Storage::open(path)?,
            defaults: Defaults::default(),
        })
    }

    // -----------------------------------------------------------------------
    // put
    // -----------------------------------------------------------------------

    /// Create a job. Lands in `waiting`, `scheduled` (delay), or `depends`
    /// (unresolved prerequisites). A jid collision with a live job is
    /// `DuplicateJob`; a terminal job is replaced.
    pub fn put(&mut self, req: PutRequest, now: DateTime<Utc>) -> Result<Jid> {
        self.storage.with_transaction(|ctx| {
            ctx.ensure_queue(&req.queue, now)?;

            let jid = req.jid.clone().unwrap_or_default();
            // Jobs still waiting on the old record wait on its replacement.
            let mut carried_dependents = Vec::new();
            if let Some(existing) = ctx.get_job(&jid)? {
                if !existing.state.is_terminal() {
                    return Err(Error::DuplicateJob(jid));
                }
                carried_dependents = ctx.dependents_of(&jid)?;
                ctx.delete_job(&jid)?;
            }

            // Prerequisites must exist; already-completed ones don't block.
            let mut depends_on = Vec::new();
            for dep in &req.depends {
                let prereq = ctx.require_job(dep)?;
                if prereq.state != JobState::Completed {
                    depends_on.push(dep.clone());
                }
            }

            let ready_at = (req.delay > 0).then(|| now + Duration::seconds(req.delay));
            let state = if !depends_on.is_empty() {
                JobState::Depends
            } else if ready_at.is_some() {
                JobState::Scheduled
            } else {
                JobState::Waiting
            };

            let job = Job {
                jid: jid.clone(),
                queue: Some(req.queue.clone()),
                data: req.data,
                priority: req.priority,
                state,
                tags: req.tags,
                worker: None,
                expires_at: None,
                remaining: req.retries,
                retries: req.retries,
                ready_at,
                depends_on: depends_on.clone(),
                dependents: Vec::new(),
                tracked: false,
                failure: None,
                history: vec![HistoryCycle {
                    queue: req.queue.clone(),
                    put: now,
                    popped: None,
                    done: None,
                    worker: None,
                }],
                spawned_from: None,
                created_at: now,
            };

            ctx.insert_job(&job)?;
            for dep in &depends_on {
                ctx.add_dep(&jid, dep)?;
            }
            for dependent in &carried_dependents {
                ctx.add_dep(dependent, &jid)?;
            }
            for tag in &job.tags {
                ctx.add_tag(tag, &jid)?;
            }
            if state == JobState::Waiting {
                let seq = ctx.next_put_seq()?;
                ctx.set_put_seq(&jid, seq)?;
            }

            debug!(jid = %jid, queue = %req.queue, state = %state, "put job");
            Ok(jid)
        })
    }

    /// Get a job snapshot by jid.
    pub fn get(&self, jid: &Jid) -> Result<Option<Job>> {
        self.storage.get_job(jid)
    }

    // -----------------------------------------------------------------------
    // pop / peek
    // -----------------------------------------------------------------------

    /// Pop up to `count` jobs for `worker`, best first. Runs the queue's
    /// maintenance pass first (recurring spawns, stall recovery, ready
    /// promotion), then leases each popped job until `now` plus the
    /// heartbeat timeout. Never blocks; an empty result means poll later.
    pub fn pop(
        &mut self,
        queue: &str,
        worker: &str,
        count: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let defaults = self.defaults;
        self.storage.with_transaction(|ctx| {
            ctx.ensure_queue(queue, now)?;
            recur::spawn_due(ctx, queue, now)?;
            maintenance::recover_stalled(ctx, &defaults, queue, now)?;
            maintenance::promote_ready(ctx, queue, now)?;

            let timeout = config_i64(ctx, &defaults, keys::HEARTBEAT_TIMEOUT)?;
            let buckets = histogram_buckets(ctx, &defaults)?;

            let mut popped = Vec::new();
            for jid in ctx.waiting_jids(queue, count)? {
                let mut job = ctx.require_job(&jid)?;
                transition(&mut job, JobState::Running)?;
                job.worker = Some(worker.to_string());
                job.expires_at = Some(now + Duration::seconds(timeout));

                let mut wait = 0.0;
                if let Some(cycle) = job.history.last_mut() {
                    cycle.popped = Some(now);
                    cycle.worker = Some(worker.to_string());
                    wait = seconds_between(cycle.put, now);
                }
                ctx.save_job(&job)?;

                stats_update(ctx, queue, now, buckets, |s| s.wait.record(wait))?;
                if job.tracked {
                    ctx.record_event(
                        EventKind::Popped {
                            jid: jid.clone(),
                            queue: queue.to_string(),
                            worker: worker.to_string(),
                        },
                        now,
                    )?;
                }
                popped.push(job);
            }

            debug!(queue, worker, count = popped.len(), "popped jobs");
            Ok(popped)
        })
    }

    /// Like `pop` without taking leases: runs the same maintenance pass,
    /// then returns the jobs `pop` would hand out next.
    pub fn peek(&mut self, queue: &str, count: u64, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let defaults = self.defaults;
        self.storage.with_transaction(|ctx| {
            ctx.ensure_queue(queue, now)?;
            recur::spawn_due(ctx, queue, now)?;
            maintenance::recover_stalled(ctx, &defaults, queue, now)?;
            maintenance::promote_ready(ctx, queue, now)?;

            let mut jobs = Vec::new();
            for jid in ctx.waiting_jids(queue, count)? {
                jobs.push(ctx.require_job(&jid)?);
            }
            Ok(jobs)
        })
    }

    // -----------------------------------------------------------------------
    // heartbeat
    // -----------------------------------------------------------------------

    /// Renew the lease on a running job. Optionally updates the payload.
    /// Returns the new expiry. `LostLock` if the worker no longer owns the
    /// job — the job stalled and was reclaimed, moved, or canceled.
    pub fn heartbeat(
        &mut self,
        jid: &Jid,
        worker: &str,
        data: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let defaults = self.defaults;
        self.storage.with_transaction(|ctx| {
            let mut job = ctx.require_job(jid)?;
            check_lease(&job, worker, JobState::Running)?;

            let timeout = config_i64(ctx, &defaults, keys::HEARTBEAT_TIMEOUT)?;
            let expires = now + Duration::seconds(timeout);
            job.expires_at = Some(expires);
            if let Some(data) = data {
                job.data = data;
            }
            ctx.save_job(&job)?;

            debug!(jid = %jid, worker, expires = %expires, "heartbeat");
            Ok(expires)
        })
    }

    // -----------------------------------------------------------------------
    // complete
    // -----------------------------------------------------------------------

    /// Finish a running job. With `next`, the job advances into the next
    /// queue with its retry budget restored; without, it completes,
    /// releases its dependents, and becomes subject to retention. Returns
    /// the job's new state.
    pub fn complete(
        &mut self,
        jid: &Jid,
        worker: &str,
        data: Option<serde_json::Value>,
        next: Option<Advance>,
        now: DateTime<Utc>,
    ) -> Result<JobState> {
        let defaults = self.defaults;
        self.storage.with_transaction(|ctx| {
            let mut job = ctx.require_job(jid)?;
            check_lease(&job, worker, JobState::Completed)?;

            if let Some(data) = data {
                job.data = data;
            }

            let buckets = histogram_buckets(ctx, &defaults)?;
            let queue = job.queue.clone().unwrap_or_default();
            let mut run = 0.0;
            if let Some(cycle) = job.history.last_mut() {
                if let Some(popped) = cycle.popped {
                    run = seconds_between(popped, now);
                }
                cycle.done = Some(now);
            }
            stats_update(ctx, &queue, now, buckets, |s| s.run.record(run))?;

            job.worker = None;
            job.expires_at = None;

            let state = match next {
                Some(advance) => {
                    ctx.ensure_queue(&advance.queue, now)?;
                    let to = if advance.delay > 0 {
                        JobState::Scheduled
                    } else {
                        JobState::Waiting
                    };
                    transition(&mut job, to)?;
                    job.queue = Some(advance.queue.clone());
                    job.remaining = job.retries;
                    job.ready_at =
                        (advance.delay > 0).then(|| now + Duration::seconds(advance.delay));
                    job.history.push(HistoryCycle {
                        queue: advance.queue.clone(),
                        put: now,
                        popped: None,
                        done: None,
                        worker: None,
                    });
                    ctx.save_job(&job)?;
                    if to == JobState::Waiting {
                        let seq = ctx.next_put_seq()?;
                        ctx.set_put_seq(jid, seq)?;
                    }
                    if job.tracked {
                        ctx.record_event(
                            EventKind::Put {
                                jid: jid.clone(),
                                queue: advance.queue,
                            },
                            now,
                        )?;
                    }
                    to
                }
                None => {
                    transition(&mut job, JobState::Completed)?;
                    job.queue = None;
                    ctx.save_job(&job)?;
                    ctx.set_terminal_at(jid, Some(now))?;

                    release_dependents(ctx, jid, now)?;

                    if job.tracked {
                        ctx.record_event(EventKind::Completed { jid: jid.clone() }, now)?;
                    }
                    maintenance::purge_terminal(ctx, &defaults, now)?;
                    JobState::Completed
                }
            };

            debug!(jid = %jid, worker, state = %state, "completed job");
            Ok(state)
        })
    }

    // -----------------------------------------------------------------------
    // fail
    // -----------------------------------------------------------------------

    /// Fail a running job without retry, recording the failure under
    /// `group` for operator visibility. Requires the current lease; by
    /// contract with callers this is for non-transient errors (transient
    /// ones go through `retry` or simply stall).
    pub fn fail(
        &mut self,
        jid: &Jid,
        worker: &str,
        group: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let defaults = self.defaults;
        self.storage.with_transaction(|ctx| {
            let mut job = ctx.require_job(jid)?;
            check_lease(&job, worker, JobState::Failed)?;

            fail_job(ctx, &defaults, &mut job, group, message, now)?;
            debug!(jid = %jid, worker, group, "failed job");
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // retry
    // -----------------------------------------------------------------------

    /// Worker-initiated retry: consume one retry and requeue (optionally
    /// after `delay` seconds). Exhausting the budget fails the job with
    /// the reserved group `failed-retries-<queue>`. Returns retries left,
    /// or -1 once exhausted.
    pub fn retry(
        &mut self,
        jid: &Jid,
        queue: &str,
        worker: &str,
        delay: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let defaults = self.defaults;
        self.storage.with_transaction(|ctx| {
            let mut job = ctx.require_job(jid)?;
            if job.queue.as_deref() != Some(queue) {
                return Err(Error::LostLock {
                    jid: jid.clone(),
                    worker: worker.to_string(),
                });
            }
            check_lease(&job, worker, JobState::Waiting)?;

            job.remaining -= 1;
            let buckets = histogram_buckets(ctx, &defaults)?;
            stats_update(ctx, queue, now, buckets, |s| s.retries += 1)?;

            if job.remaining < 0 {
                let group = format!("failed-retries-{queue}");
                fail_job(ctx, &defaults, &mut job, &group, "retries exhausted", now)?;
                return Ok(job.remaining);
            }

            job.worker = None;
            job.expires_at = None;
            let to = if delay > 0 {
                JobState::Scheduled
            } else {
                JobState::Waiting
            };
            transition(&mut job, to)?;
            job.ready_at = (delay > 0).then(|| now + Duration::seconds(delay));
            job.history.push(HistoryCycle {
                queue: queue.to_string(),
                put: now,
                popped: None,
                done: None,
                worker: None,
            });
            ctx.save_job(&job)?;
            if to == JobState::Waiting {
                let seq = ctx.next_put_seq()?;
                ctx.set_put_seq(jid, seq)?;
            }

            debug!(jid = %jid, worker, remaining = job.remaining, "retried job");
            Ok(job.remaining)
        })
    }

    // -----------------------------------------------------------------------
    // cancel
    // -----------------------------------------------------------------------

    /// Withdraw a job from any state, completed included. Refused with
    /// `DependentJobs` while other jobs still depend on it. Cancellation
    /// does not count toward stats.
    pub fn cancel(&mut self, jid: &Jid, now: DateTime<Utc>) -> Result<()> {
        let defaults = self.defaults;
        self.storage.with_transaction(|ctx| {
            let mut job = ctx.require_job(jid)?;
            if job.state == JobState::Canceled {
                return Ok(());
            }

            let dependents = ctx.dependents_of(jid)?;
            if !dependents.is_empty() {
                return Err(Error::DependentJobs {
                    jid: jid.clone(),
                    count: dependents.len(),
                });
            }

            transition(&mut job, JobState::Canceled)?;
            ctx.remove_all_deps(jid)?;
            ctx.remove_all_tags(jid)?;
            job.queue = None;
            job.worker = None;
            job.expires_at = None;
            job.failure = None;
            ctx.save_job(&job)?;
            ctx.set_terminal_at(jid, Some(now))?;

            if job.tracked {
                ctx.record_event(EventKind::Canceled { jid: jid.clone() }, now)?;
            }
            maintenance::purge_terminal(ctx, &defaults, now)?;

            debug!(jid = %jid, "canceled job");
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Shared internals
// ---------------------------------------------------------------------------

/// Validate and apply a state transition on an in-memory job.
pub(super) fn transition(job: &mut Job, to: JobState) -> Result<()> {
    if !job.state.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            jid: job.jid.clone(),
            from: job.state,
            to,
        });
    }
    job.state = to;
    Ok(())
}

/// Identity check for lease-consuming calls (`heartbeat`, `complete`,
/// `fail`, `retry`). A compare-and-swap on the worker name, not a lock:
/// losing it means the caller's view of the job is stale.
pub(super) fn check_lease(job: &Job, worker: &str, to: JobState) -> Result<()> {
    match job.state {
        JobState::Running if job.worker.as_deref() == Some(worker) => Ok(()),
        JobState::Running
        | JobState::Waiting
        | JobState::Scheduled
        | JobState::Depends
        | JobState::Stalled => Err(Error::LostLock {
            jid: job.jid.clone(),
            worker: worker.to_string(),
        }),
        from => Err(Error::InvalidTransition {
            jid: job.jid.clone(),
            from,
            to,
        }),
    }
}

/// Move a running job to `failed` with a failure record; used by `fail`,
/// `retry` exhaustion, and stall exhaustion.
pub(super) fn fail_job(
    ctx: &mut TxContext,
    defaults: &Defaults,
    job: &mut Job,
    group: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let queue = job.queue.clone().unwrap_or_default();
    transition(job, JobState::Failed)?;
    job.failure = Some(Failure {
        group: group.to_string(),
        message: message.to_string(),
        worker: job.worker.clone(),
        at: now,
    });
    job.worker = None;
    job.expires_at = None;
    ctx.save_job(job)?;
    ctx.set_terminal_at(&job.jid, Some(now))?;

    let buckets = histogram_buckets(ctx, defaults)?;
    stats_update(ctx, &queue, now, buckets, |s| s.failed += 1)?;

    if job.tracked {
        ctx.record_event(
            EventKind::Failed {
                jid: job.jid.clone(),
                group: group.to_string(),
            },
            now,
        )?;
    }
    Ok(())
}

/// On a prerequisite's completion, drop its edges and wake dependents
/// whose dependency sets became empty.
fn release_dependents(ctx: &mut TxContext, jid: &Jid, now: DateTime<Utc>) -> Result<()> {
    for dependent in ctx.dependents_of(jid)? {
        ctx.remove_dep(&dependent, jid)?;
        if !ctx.unresolved_deps(&dependent)?.is_empty() {
            continue;
        }
        let mut dep_job = ctx.require_job(&dependent)?;
        if dep_job.state != JobState::Depends {
            continue;
        }
        let to = match dep_job.ready_at {
            Some(ready) if ready > now => JobState::Scheduled,
            _ => JobState::Waiting,
        };
        transition(&mut dep_job, to)?;
        ctx.save_job(&dep_job)?;
        if to == JobState::Waiting {
            let seq = ctx.next_put_seq()?;
            ctx.set_put_seq(&dependent, seq)?;
        }
        debug!(jid = %dependent, released_by = %jid, state = %to, "dependency released");
    }
    Ok(())
}

/// Effective integer config value: stored, else built-in default.
pub(super) fn config_i64(ctx: &TxContext, defaults: &Defaults, key: &str) -> Result<i64> {
    match ctx.config_get(key)? {
        Some(value) => parse_int(key, &value),
        None => {
            let value = defaults
                .value_for(key)
                .ok_or_else(|| Error::Config {
                    key: key.to_string(),
                    value: "<unset>".to_string(),
                })?;
            parse_int(key, &value)
        }
    }
}

pub(super) fn histogram_buckets(ctx: &TxContext, defaults: &Defaults) -> Result<usize> {
    Ok(config_i64(ctx, defaults, keys::HISTOGRAM_BUCKETS)?.max(1) as usize)
}

/// Load-modify-save the day's stats row for a queue.
pub(super) fn stats_update(
    ctx: &TxContext,
    queue: &str,
    now: DateTime<Utc>,
    buckets: usize,
    f: impl FnOnce(&mut QueueStats),
) -> Result<()> {
    let day = day_of(now);
    let mut stats = ctx
        .stats_get(queue, day)?
        .unwrap_or_else(|| QueueStats::empty(queue, day, buckets));
    f(&mut stats);
    ctx.stats_save(&stats)
}

pub(super) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds().max(0) as f64 / 1000.0
}
