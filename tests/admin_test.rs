//! Integration tests for the operator surface: tags, tracking, config,
//! stats, failure groups, and retention.

use chrono::{DateTime, TimeZone, Utc};
use jobq::{Engine, Error, EventKind, Jid, JobState, PutRequest};

fn test_engine() -> Engine {
    Engine::in_memory().expect("failed to create in-memory engine")
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[test]
fn tags_round_trip_through_the_index() {
    let mut engine = test_engine();

    let jid = engine
        .put(PutRequest::new("q").tags(vec!["video".into()]), at(0))
        .unwrap();
    engine.tag(&jid, &["urgent".into()]).unwrap();

    assert_eq!(engine.tagged("video").unwrap(), vec![jid.clone()]);
    assert_eq!(engine.tagged("urgent").unwrap(), vec![jid.clone()]);
    let job = engine.get(&jid).unwrap().unwrap();
    assert_eq!(job.tags, vec!["video", "urgent"]);

    engine.untag(&jid, &["video".into()]).unwrap();
    assert!(engine.tagged("video").unwrap().is_empty());
    assert_eq!(engine.get(&jid).unwrap().unwrap().tags, vec!["urgent"]);
}

#[test]
fn unknown_tag_reads_as_empty() {
    let engine = test_engine();
    assert!(engine.tagged("nothing-here").unwrap().is_empty());
}

#[test]
fn tagging_twice_does_not_duplicate() {
    let mut engine = test_engine();

    let jid = engine.put(PutRequest::new("q"), at(0)).unwrap();
    engine.tag(&jid, &["x".into()]).unwrap();
    let tags = engine.tag(&jid, &["x".into()]).unwrap();
    assert_eq!(tags, vec!["x"]);
}

#[test]
fn canceling_a_job_clears_its_tag_entries() {
    let mut engine = test_engine();

    let jid = engine
        .put(PutRequest::new("q").tags(vec!["t".into()]), at(0))
        .unwrap();
    engine.cancel(&jid, at(1)).unwrap();
    assert!(engine.tagged("t").unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Tracking and events
// ---------------------------------------------------------------------------

#[test]
fn tracked_job_emits_lifecycle_events() {
    let mut engine = test_engine();

    let jid = engine.put(PutRequest::new("q"), at(0)).unwrap();
    engine.track(&jid, at(1)).unwrap();
    assert_eq!(engine.tracked().unwrap(), vec![jid.clone()]);

    engine.pop("q", "w", 1, at(2)).unwrap();
    engine.complete(&jid, "w", None, None, at(3)).unwrap();

    let events = engine.events_since(0).unwrap();
    let kinds: Vec<&EventKind> = events.iter().map(|e| &e.kind).collect();
    assert!(matches!(kinds[0], EventKind::Track { .. }));
    assert!(matches!(kinds[1], EventKind::Popped { .. }));
    assert!(matches!(kinds[2], EventKind::Completed { .. }));

    // seq cursor: nothing before, everything after
    let tail = engine.events_since(events[1].seq).unwrap();
    assert_eq!(tail.len(), 1);
}

#[test]
fn untracked_job_emits_nothing_but_the_untrack_itself() {
    let mut engine = test_engine();

    let jid = engine.put(PutRequest::new("q"), at(0)).unwrap();
    engine.track(&jid, at(1)).unwrap();
    engine.untrack(&jid, at(2)).unwrap();
    engine.pop("q", "w", 1, at(3)).unwrap();

    let events = engine.events_since(0).unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1].kind, EventKind::Untrack { .. }));
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[test]
fn config_defaults_apply_until_overridden() {
    let mut engine = test_engine();

    assert_eq!(
        engine.config_get("heartbeat-timeout").unwrap().as_deref(),
        Some("60")
    );

    engine.config_set("heartbeat-timeout", "10").unwrap();
    assert_eq!(
        engine.config_get("heartbeat-timeout").unwrap().as_deref(),
        Some("10")
    );

    engine.config_unset("heartbeat-timeout").unwrap();
    assert_eq!(
        engine.config_get("heartbeat-timeout").unwrap().as_deref(),
        Some("60")
    );
}

#[test]
fn shorter_heartbeat_timeout_takes_effect_on_the_next_pop() {
    let mut engine = test_engine();

    engine.config_set("heartbeat-timeout", "5").unwrap();
    let jid = engine.put(PutRequest::new("q"), at(0)).unwrap();
    let popped = engine.pop("q", "w1", 1, at(0)).unwrap();
    assert_eq!(popped[0].expires_at, Some(at(5)));

    // stalls after 5s now
    let reclaimed = engine.pop("q", "w2", 1, at(6)).unwrap();
    assert_eq!(reclaimed[0].jid, jid);
}

#[test]
fn unknown_config_keys_are_stored_verbatim() {
    let mut engine = test_engine();

    assert_eq!(engine.config_get("custom-flag").unwrap(), None);
    engine.config_set("custom-flag", "on").unwrap();
    assert_eq!(
        engine.config_get("custom-flag").unwrap().as_deref(),
        Some("on")
    );

    let all = engine.config_all().unwrap();
    assert!(all.contains(&("custom-flag".into(), "on".into())));
    assert!(all.contains(&("jobs-history".into(), "604800".into())));
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[test]
fn wait_and_run_times_feed_the_day_stats() {
    let mut engine = test_engine();

    let jid = engine.put(PutRequest::new("q"), at(0)).unwrap();
    engine.pop("q", "w", 1, at(10)).unwrap();
    engine.complete(&jid, "w", None, None, at(25)).unwrap();

    let stats = engine.stats("q", at(25)).unwrap();
    assert_eq!(stats.wait.count, 1);
    assert!((stats.wait.mean - 10.0).abs() < 1e-9);
    assert_eq!(stats.run.count, 1);
    assert!((stats.run.mean - 15.0).abs() < 1e-9);
    assert_eq!(stats.failed, 0);
}

#[test]
fn failures_and_retries_count_per_day() {
    let mut engine = test_engine();

    let a = engine.put(PutRequest::new("q").jid("a"), at(0)).unwrap();
    engine.pop("q", "w", 1, at(1)).unwrap();
    engine.fail(&a, "w", "boom", "exploded", at(2)).unwrap();

    let b = engine.put(PutRequest::new("q").jid("b"), at(3)).unwrap();
    engine.pop("q", "w", 1, at(4)).unwrap();
    engine.retry(&b, "q", "w", 0, at(5)).unwrap();

    let stats = engine.stats("q", at(6)).unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retries, 1);
}

#[test]
fn stats_reset_at_the_day_boundary() {
    let mut engine = test_engine();

    let jid = engine.put(PutRequest::new("q"), at(0)).unwrap();
    engine.pop("q", "w", 1, at(1)).unwrap();
    engine.fail(&jid, "w", "g", "m", at(2)).unwrap();

    assert_eq!(engine.stats("q", at(2)).unwrap().failed, 1);
    assert_eq!(engine.stats("q", at(86_400 + 2)).unwrap().failed, 0);
}

// ---------------------------------------------------------------------------
// Queue introspection
// ---------------------------------------------------------------------------

#[test]
fn queues_reports_counts_per_state() {
    let mut engine = test_engine();

    engine.put(PutRequest::new("q").jid("w1"), at(0)).unwrap();
    engine.put(PutRequest::new("q").jid("w2"), at(0)).unwrap();
    engine
        .put(PutRequest::new("q").jid("s1").delay(500), at(0))
        .unwrap();
    engine.pop("q", "worker", 1, at(1)).unwrap();

    let queues = engine.queues(at(2)).unwrap();
    assert_eq!(queues.len(), 1);
    let q = &queues[0];
    assert_eq!(q.name, "q");
    assert_eq!(q.waiting, 1);
    assert_eq!(q.scheduled, 1);
    assert_eq!(q.running, 1);
    assert_eq!(q.stalled, 0);

    assert_eq!(engine.length("q", at(2)).unwrap(), 3);
}

#[test]
fn expired_leases_show_up_as_stalled_in_counts() {
    let mut engine = test_engine();

    engine.put(PutRequest::new("q"), at(0)).unwrap();
    engine.pop("q", "w", 1, at(0)).unwrap();

    let counts = engine.counts("q", at(61)).unwrap();
    assert_eq!(counts.running, 0);
    assert_eq!(counts.stalled, 1);
}

#[test]
fn counts_for_an_unknown_queue_is_an_error() {
    let engine = test_engine();
    assert!(matches!(
        engine.counts("nope", at(0)).unwrap_err(),
        Error::UnknownQueue(_)
    ));
}

#[test]
fn jids_lists_a_state_in_its_natural_order() {
    let mut engine = test_engine();

    engine.put(PutRequest::new("q").jid("low"), at(0)).unwrap();
    engine
        .put(PutRequest::new("q").jid("high").priority(9), at(1))
        .unwrap();

    let waiting = engine.jids("q", JobState::Waiting, at(2), 0, 10).unwrap();
    assert_eq!(waiting, vec![Jid::from("high"), Jid::from("low")]);
}

#[test]
fn stalled_listing_paginates_by_lease_expiry() {
    let mut engine = test_engine();

    engine.put(PutRequest::new("q").jid("a"), at(0)).unwrap();
    engine.put(PutRequest::new("q").jid("b"), at(0)).unwrap();
    engine.pop("q", "w1", 1, at(0)).unwrap(); // expires at 60
    engine.pop("q", "w2", 1, at(10)).unwrap(); // expires at 70

    let all = engine.jids("q", JobState::Stalled, at(100), 0, 10).unwrap();
    assert_eq!(all, vec![Jid::from("a"), Jid::from("b")]);

    let tail = engine.jids("q", JobState::Stalled, at(100), 1, 10).unwrap();
    assert_eq!(tail, vec![Jid::from("b")]);
}

// ---------------------------------------------------------------------------
// Failure groups and unfail
// ---------------------------------------------------------------------------

#[test]
fn failed_jobs_are_browsable_by_group() {
    let mut engine = test_engine();

    for (jid, group) in [("a", "dns"), ("b", "dns"), ("c", "tls")] {
        let jid = engine.put(PutRequest::new("q").jid(jid), at(0)).unwrap();
        engine.pop("q", "w", 1, at(1)).unwrap();
        engine.fail(&jid, "w", group, "broke", at(2)).unwrap();
    }

    let groups = engine.failed().unwrap();
    assert_eq!(groups, vec![("dns".into(), 2), ("tls".into(), 1)]);

    let dns = engine.failed_jobs("dns", 0, 10).unwrap();
    assert_eq!(dns.len(), 2);
}

#[test]
fn unfail_requeues_with_a_fresh_budget() {
    let mut engine = test_engine();

    let jid = engine
        .put(PutRequest::new("q").retries(3), at(0))
        .unwrap();
    engine.pop("q", "w", 1, at(1)).unwrap();
    engine.retry(&jid, "q", "w", 0, at(2)).unwrap(); // remaining 2
    engine.pop("q", "w", 1, at(3)).unwrap();
    engine.fail(&jid, "w", "bad-input", "oops", at(4)).unwrap();

    let moved = engine.unfail("bad-input", "q", 10, at(5)).unwrap();
    assert_eq!(moved, 1);

    let job = engine.get(&jid).unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.remaining, 3);
    assert!(job.failure.is_none());
    assert!(engine.failed().unwrap().is_empty());

    // poppable again
    let popped = engine.pop("q", "w2", 1, at(6)).unwrap();
    assert_eq!(popped[0].jid, jid);
}

#[test]
fn unfail_honors_the_count_limit() {
    let mut engine = test_engine();

    for jid in ["a", "b", "c"] {
        let jid = engine.put(PutRequest::new("q").jid(jid), at(0)).unwrap();
        engine.pop("q", "w", 1, at(1)).unwrap();
        engine.fail(&jid, "w", "g", "m", at(2)).unwrap();
    }

    assert_eq!(engine.unfail("g", "q", 2, at(3)).unwrap(), 2);
    assert_eq!(engine.failed().unwrap(), vec![("g".into(), 1)]);
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[test]
fn retention_count_cap_evicts_the_oldest_terminal_jobs() {
    let mut engine = test_engine();
    engine.config_set("jobs-history-count", "2").unwrap();

    let mut jids = Vec::new();
    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        let t = i as i64 * 10;
        let jid = engine.put(PutRequest::new("q").jid(*name), at(t)).unwrap();
        engine.pop("q", "w", 1, at(t + 1)).unwrap();
        engine.complete(&jid, "w", None, None, at(t + 2)).unwrap();
        jids.push(jid);
    }

    assert!(engine.get(&jids[0]).unwrap().is_none());
    assert!(engine.get(&jids[1]).unwrap().is_none());
    assert!(engine.get(&jids[2]).unwrap().is_some());
    assert!(engine.get(&jids[3]).unwrap().is_some());
}

#[test]
fn retention_time_cap_evicts_old_completions() {
    let mut engine = test_engine();
    engine.config_set("jobs-history", "100").unwrap();

    let old = engine.put(PutRequest::new("q").jid("old"), at(0)).unwrap();
    engine.pop("q", "w", 1, at(0)).unwrap();
    engine.complete(&old, "w", None, None, at(1)).unwrap();

    let fresh = engine
        .put(PutRequest::new("q").jid("fresh"), at(200))
        .unwrap();
    engine.pop("q", "w", 1, at(200)).unwrap();
    engine.complete(&fresh, "w", None, None, at(201)).unwrap();

    assert!(engine.get(&old).unwrap().is_none());
    assert!(engine.get(&fresh).unwrap().is_some());
}

#[test]
fn failed_jobs_are_never_purged_by_retention() {
    let mut engine = test_engine();
    engine.config_set("jobs-history", "10").unwrap();

    let failed = engine.put(PutRequest::new("q").jid("f"), at(0)).unwrap();
    engine.pop("q", "w", 1, at(0)).unwrap();
    engine.fail(&failed, "w", "g", "m", at(1)).unwrap();

    let later = engine.put(PutRequest::new("q").jid("ok"), at(500)).unwrap();
    engine.pop("q", "w", 1, at(500)).unwrap();
    engine.complete(&later, "w", None, None, at(501)).unwrap();

    assert!(engine.get(&failed).unwrap().is_some());
}
