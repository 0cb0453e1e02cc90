//! Recurring templates: standing job specifications that spawn fresh
//! instances at a fixed interval.
//!
//! Spawning copies template fields into the new job record, so editing a
//! template never rewrites instances already spawned. Catch-up is
//! deliberate: if nobody touched the queue for several intervals, every
//! missed interval still yields an instance.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::Engine;
use crate::error::{Error, Result};
use crate::model::*;
use crate::storage::TxContext;

/// Field updates for `Engine::recur_update`. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct RecurUpdate {
    pub data: Option<serde_json::Value>,
    pub priority: Option<i64>,
    /// New interval in seconds. Takes effect from the next spawn.
    pub interval: Option<i64>,
    pub retries: Option<i64>,
    pub tags: Option<Vec<String>>,
}

impl Engine {
    /// Register a recurring template. The first spawn is due `offset`
    /// seconds from `now`, then every `interval` seconds after.
    pub fn recur(&mut self, req: RecurRequest, now: DateTime<Utc>) -> Result<Jid> {
        self.storage.with_transaction(|ctx| {
            ctx.ensure_queue(&req.queue, now)?;

            let jid = req.jid.clone().unwrap_or_default();
            if ctx.recurring_exists(&jid)? || ctx.get_job(&jid)?.is_some() {
                return Err(Error::DuplicateJob(jid));
            }

            let template = RecurringJob {
                jid: jid.clone(),
                queue: req.queue.clone(),
                data: req.data,
                priority: req.priority,
                interval: req.interval,
                next_at: now + Duration::seconds(req.offset),
                tags: req.tags,
                retries: req.retries,
                spawned: 0,
            };
            ctx.insert_recurring(&template)?;

            debug!(jid = %jid, queue = %req.queue, interval = req.interval, "registered recurring template");
            Ok(jid)
        })
    }

    /// Get a recurring template.
    pub fn recur_get(&self, jid: &Jid) -> Result<Option<RecurringJob>> {
        self.storage.get_recurring(jid)
    }

    /// Edit a template. Only future spawns are affected.
    pub fn recur_update(&mut self, jid: &Jid, update: RecurUpdate) -> Result<RecurringJob> {
        self.storage.with_transaction(|ctx| {
            let mut template = ctx
                .get_recurring(jid)?
                .ok_or_else(|| Error::UnknownRecurringJob(jid.clone()))?;

            if let Some(data) = update.data {
                template.data = data;
            }
            if let Some(priority) = update.priority {
                template.priority = priority;
            }
            if let Some(interval) = update.interval {
                template.interval = interval.max(1);
            }
            if let Some(retries) = update.retries {
                template.retries = retries;
            }
            if let Some(tags) = update.tags {
                template.tags = tags;
            }
            ctx.save_recurring(&template)?;
            Ok(template)
        })
    }

    /// Remove a template. Already-spawned instances are untouched.
    pub fn unrecur(&mut self, jid: &Jid) -> Result<()> {
        self.storage.with_transaction(|ctx| {
            if !ctx.delete_recurring(jid)? {
                return Err(Error::UnknownRecurringJob(jid.clone()));
            }
            Ok(())
        })
    }

    /// Spawn every due instance for a queue's templates. `pop` and `peek`
    /// do this implicitly; this is the explicit tick for callers that
    /// never pop (dashboards, tests). Returns spawned jids.
    pub fn tick_recurring(&mut self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Jid>> {
        self.storage
            .with_transaction(|ctx| spawn_due(ctx, queue, now))
    }
}

/// One instance per elapsed interval since the template came due:
/// `floor(elapsed / interval) + 1` spawns, offset advanced past them all.
pub(super) fn spawn_due(ctx: &mut TxContext, queue: &str, now: DateTime<Utc>) -> Result<Vec<Jid>> {
    let mut spawned_jids = Vec::new();

    for mut template in ctx.due_recurring(queue, now)? {
        let interval_ms = template.interval.max(1) * 1000;
        let elapsed_ms = (now - template.next_at).num_milliseconds();
        let n = elapsed_ms / interval_ms + 1;

        for _ in 0..n {
            let jid = Jid::spawned(&template.jid, template.spawned);
            let job = Job {
                jid: jid.clone(),
                queue: Some(queue.to_string()),
                data: template.data.clone(),
                priority: template.priority,
                state: JobState::Waiting,
                tags: template.tags.clone(),
                worker: None,
                expires_at: None,
                remaining: template.retries,
                retries: template.retries,
                ready_at: None,
                depends_on: Vec::new(),
                dependents: Vec::new(),
                tracked: false,
                failure: None,
                history: vec![HistoryCycle {
                    queue: queue.to_string(),
                    put: now,
                    popped: None,
                    done: None,
                    worker: None,
                }],
                spawned_from: Some(template.jid.clone()),
                created_at: now,
            };
            // A replaced template can collide with a leftover instance jid;
            // the fresh spawn wins only if the old one is terminal.
            if let Some(existing) = ctx.get_job(&jid)? {
                if !existing.state.is_terminal() {
                    template.spawned += 1;
                    continue;
                }
                ctx.delete_job(&jid)?;
            }
            ctx.insert_job(&job)?;
            for tag in &job.tags {
                ctx.add_tag(tag, &jid)?;
            }
            let seq = ctx.next_put_seq()?;
            ctx.set_put_seq(&jid, seq)?;

            template.spawned += 1;
            spawned_jids.push(jid);
        }

        template.next_at += Duration::milliseconds(n * interval_ms);
        ctx.save_recurring(&template)?;
        debug!(template = %template.jid, queue, spawned = n, "spawned recurring instances");
    }

    Ok(spawned_jids)
}
