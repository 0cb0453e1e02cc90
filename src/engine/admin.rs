//! Operator surface: tags, tracking, config, stats, queue introspection,
//! and failure-group management.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{Engine, transition};
use crate::config::keys;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::*;
use crate::stats::{QueueStats, day_of};

impl Engine {
    // -----------------------------------------------------------------------
    // Tags
    // -----------------------------------------------------------------------

    /// Add tags to a job. The job's tag set and the inverted index move
    /// together in one transaction.
    pub fn tag(&mut self, jid: &Jid, tags: &[String]) -> Result<Vec<String>> {
        self.storage.with_transaction(|ctx| {
            let mut job = ctx.require_job(jid)?;
            for tag in tags {
                if !job.tags.contains(tag) {
                    job.tags.push(tag.clone());
                }
                ctx.add_tag(tag, jid)?;
            }
            ctx.save_job(&job)?;
            Ok(job.tags)
        })
    }

    /// Remove tags from a job. Untagging something absent is a no-op.
    pub fn untag(&mut self, jid: &Jid, tags: &[String]) -> Result<Vec<String>> {
        self.storage.with_transaction(|ctx| {
            let mut job = ctx.require_job(jid)?;
            job.tags.retain(|t| !tags.contains(t));
            for tag in tags {
                ctx.remove_tag(tag, jid)?;
            }
            ctx.save_job(&job)?;
            Ok(job.tags)
        })
    }

    /// Jids carrying a tag; empty for an unknown tag, never an error.
    pub fn tagged(&self, tag: &str) -> Result<Vec<Jid>> {
        self.storage.tagged(tag)
    }

    // -----------------------------------------------------------------------
    // Tracking
    // -----------------------------------------------------------------------

    /// Flag a job to emit lifecycle events.
    pub fn track(&mut self, jid: &Jid, now: DateTime<Utc>) -> Result<()> {
        self.storage.with_transaction(|ctx| {
            let mut job = ctx.require_job(jid)?;
            job.tracked = true;
            ctx.save_job(&job)?;
            ctx.record_event(EventKind::Track { jid: jid.clone() }, now)?;
            Ok(())
        })
    }

    /// Stop emitting lifecycle events for a job.
    pub fn untrack(&mut self, jid: &Jid, now: DateTime<Utc>) -> Result<()> {
        self.storage.with_transaction(|ctx| {
            let mut job = ctx.require_job(jid)?;
            job.tracked = false;
            ctx.save_job(&job)?;
            ctx.record_event(EventKind::Untrack { jid: jid.clone() }, now)?;
            Ok(())
        })
    }

    /// Jids currently flagged for tracking.
    pub fn tracked(&self) -> Result<Vec<Jid>> {
        self.storage.tracked_jids()
    }

    /// Events recorded after sequence number `since_seq`.
    pub fn events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        self.storage.events_since(since_seq)
    }

    // -----------------------------------------------------------------------
    // Config
    // -----------------------------------------------------------------------

    /// Effective value for a config key: stored, else built-in default,
    /// else None for keys this engine doesn't know.
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        match self.storage.config_get(key)? {
            Some(value) => Ok(Some(value)),
            None => Ok(self.defaults.value_for(key)),
        }
    }

    pub fn config_set(&mut self, key: &str, value: &str) -> Result<()> {
        self.storage.with_transaction(|ctx| {
            ctx.config_set(key, value)?;
            info!(key, value, "config set");
            Ok(())
        })
    }

    /// Drop a stored value, reverting the key to its default.
    pub fn config_unset(&mut self, key: &str) -> Result<()> {
        self.storage.with_transaction(|ctx| ctx.config_unset(key))
    }

    /// All effective settings: defaults overlaid with stored values.
    pub fn config_all(&self) -> Result<Vec<(String, String)>> {
        let mut all: Vec<(String, String)> = [
            keys::HEARTBEAT_TIMEOUT,
            keys::JOBS_HISTORY,
            keys::JOBS_HISTORY_COUNT,
            keys::HISTOGRAM_BUCKETS,
        ]
        .iter()
        .filter_map(|k| self.defaults.value_for(k).map(|v| (k.to_string(), v)))
        .collect();

        for (key, value) in self.storage.config_all()? {
            match all.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => all.push((key, value)),
            }
        }
        all.sort();
        Ok(all)
    }

    // -----------------------------------------------------------------------
    // Stats & queue introspection
    // -----------------------------------------------------------------------

    /// Wait/run distributions and failure counters for a queue on the UTC
    /// day containing `at`. A day with no samples reads as empty.
    pub fn stats(&self, queue: &str, at: DateTime<Utc>) -> Result<QueueStats> {
        let day = day_of(at);
        match self.storage.stats_get(queue, day)? {
            Some(stats) => Ok(stats),
            None => Ok(QueueStats::empty(
                queue,
                day,
                self.defaults.histogram_buckets,
            )),
        }
    }

    /// Counts for every queue ever referenced.
    pub fn queues(&self, now: DateTime<Utc>) -> Result<Vec<QueueCounts>> {
        self.storage
            .queue_names()?
            .iter()
            .map(|name| self.storage.counts(name, now))
            .collect()
    }

    /// Counts for one queue. Unknown queues are an error here, unlike
    /// `put`/`pop` which create them implicitly.
    pub fn counts(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueCounts> {
        if !self.storage.queue_exists(queue)? {
            return Err(Error::UnknownQueue(queue.to_string()));
        }
        self.storage.counts(queue, now)
    }

    /// Jobs a queue is responsible for right now, in every live state.
    pub fn length(&self, queue: &str, now: DateTime<Utc>) -> Result<u64> {
        let c = self.storage.counts(queue, now)?;
        Ok(c.waiting + c.scheduled + c.running + c.stalled + c.depends)
    }

    /// Jids in a queue+state, in that state's natural order. `Stalled`
    /// lists running jobs whose lease expired as of `now`.
    pub fn jids(
        &self,
        queue: &str,
        state: JobState,
        now: DateTime<Utc>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Jid>> {
        if state == JobState::Stalled {
            return self.storage.stalled_jids(queue, now, offset, limit);
        }
        self.storage.jids_in_state(queue, state, offset, limit)
    }

    // -----------------------------------------------------------------------
    // Failure groups
    // -----------------------------------------------------------------------

    /// Count of failed jobs per failure group.
    pub fn failed(&self) -> Result<Vec<(String, u64)>> {
        self.storage.failed_counts()
    }

    /// Failed jids in one group, oldest failure first.
    pub fn failed_jobs(&self, group: &str, offset: u64, limit: u64) -> Result<Vec<Jid>> {
        self.storage.failed_jids(group, offset, limit)
    }

    /// Move up to `count` jobs out of a failure group back into `queue`
    /// with their retry budgets restored. Returns how many moved.
    pub fn unfail(
        &mut self,
        group: &str,
        queue: &str,
        count: u64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.storage.with_transaction(|ctx| {
            ctx.ensure_queue(queue, now)?;
            let mut moved = 0;
            for jid in ctx.failed_in_group(group, count)? {
                let mut job = ctx.require_job(&jid)?;
                transition(&mut job, JobState::Waiting)?;
                job.queue = Some(queue.to_string());
                job.remaining = job.retries;
                job.failure = None;
                job.ready_at = None;
                job.history.push(HistoryCycle {
                    queue: queue.to_string(),
                    put: now,
                    popped: None,
                    done: None,
                    worker: None,
                });
                ctx.save_job(&job)?;
                ctx.set_terminal_at(&jid, None)?;
                let seq = ctx.next_put_seq()?;
                ctx.set_put_seq(&jid, seq)?;
                moved += 1;
            }
            debug!(group, queue, moved, "unfailed jobs");
            Ok(moved)
        })
    }
}
