//! Lazy maintenance: ready promotion, stalled-lease recovery, and terminal
//! retention. No timers — these run inside `pop`/`peek` or an explicit
//! `check_stalled` call, so stalls surface the next time anyone touches
//! the queue.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::{Engine, config_i64, fail_job, stats_update, transition};
use crate::config::{Defaults, keys};
use crate::error::Result;
use crate::event::EventKind;
use crate::model::{HistoryCycle, JobState};
use crate::storage::TxContext;

impl Engine {
    /// Reclaim every running job in `queue` whose lease expired at or
    /// before `now`. Each such job becomes `stalled`, then is either
    /// dropped back into `waiting` (one retry consumed, original priority)
    /// or failed with the reserved `failed-retries-<queue>` group once its
    /// budget is gone. Returns (dropped, failed) counts.
    pub fn check_stalled(&mut self, queue: &str, now: DateTime<Utc>) -> Result<(u64, u64)> {
        let defaults = self.defaults;
        self.storage
            .with_transaction(|ctx| recover_stalled(ctx, &defaults, queue, now))
    }
}

/// Shared body for `check_stalled` and the pop/peek maintenance pass.
pub(super) fn recover_stalled(
    ctx: &mut TxContext,
    defaults: &Defaults,
    queue: &str,
    now: DateTime<Utc>,
) -> Result<(u64, u64)> {
    let buckets = super::histogram_buckets(ctx, defaults)?;
    let mut dropped = 0;
    let mut failed = 0;

    for jid in ctx.expired_running_jids(queue, now)? {
        let mut job = ctx.require_job(&jid)?;
        let lost_worker = job.worker.take();
        job.expires_at = None;
        transition(&mut job, JobState::Stalled)?;

        if job.tracked {
            ctx.record_event(
                EventKind::Stalled {
                    jid: jid.clone(),
                    queue: queue.to_string(),
                },
                now,
            )?;
        }

        if job.remaining > 0 {
            job.remaining -= 1;
            transition(&mut job, JobState::Waiting)?;
            job.history.push(HistoryCycle {
                queue: queue.to_string(),
                put: now,
                popped: None,
                done: None,
                worker: None,
            });
            ctx.save_job(&job)?;
            let seq = ctx.next_put_seq()?;
            ctx.set_put_seq(&jid, seq)?;
            stats_update(ctx, queue, now, buckets, |s| s.retries += 1)?;
            dropped += 1;
            debug!(jid = %jid, ?lost_worker, remaining = job.remaining, "dropped stalled job");
        } else {
            job.worker = lost_worker.clone(); // recorded in the failure
            let group = format!("failed-retries-{queue}");
            fail_job(
                ctx,
                defaults,
                &mut job,
                &group,
                "lease expired with no retries remaining",
                now,
            )?;
            failed += 1;
            warn!(jid = %jid, ?lost_worker, "stalled job exhausted retries");
        }
    }

    Ok((dropped, failed))
}

/// Move every scheduled job whose ready time has passed into `waiting`,
/// preserving priority; ordering within a tier comes from the insertion
/// sequence assigned here.
pub(super) fn promote_ready(ctx: &mut TxContext, queue: &str, now: DateTime<Utc>) -> Result<u64> {
    let mut promoted = 0;
    for jid in ctx.scheduled_ready_jids(queue, now)? {
        let mut job = ctx.require_job(&jid)?;
        transition(&mut job, JobState::Waiting)?;
        ctx.save_job(&job)?;
        let seq = ctx.next_put_seq()?;
        ctx.set_put_seq(&jid, seq)?;
        promoted += 1;
    }
    if promoted > 0 {
        debug!(queue, promoted, "promoted scheduled jobs");
    }
    Ok(promoted)
}

/// Purge completed/canceled jobs past the retention window: older than
/// `jobs-history` seconds, or beyond the newest `jobs-history-count`.
/// Tag-index entries and dependency edges go with the job record.
pub(super) fn purge_terminal(
    ctx: &mut TxContext,
    defaults: &Defaults,
    now: DateTime<Utc>,
) -> Result<u64> {
    let history = config_i64(ctx, defaults, keys::JOBS_HISTORY)?;
    let keep = config_i64(ctx, defaults, keys::JOBS_HISTORY_COUNT)?;
    let cutoff = now - Duration::seconds(history);

    let jids = ctx.purgeable_jids(cutoff, keep)?;
    let purged = jids.len() as u64;
    for jid in jids {
        ctx.delete_job(&jid)?;
    }
    if purged > 0 {
        debug!(purged, "purged terminal jobs");
    }
    Ok(purged)
}
