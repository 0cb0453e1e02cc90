//! Integration tests for recurring templates.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use jobq::engine::recur::RecurUpdate;
use jobq::{Engine, Error, Jid, JobState, RecurRequest};

fn test_engine() -> Engine {
    Engine::in_memory().expect("failed to create in-memory engine")
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Spawning cadence
// ---------------------------------------------------------------------------

#[test]
fn due_template_spawns_one_instance_per_elapsed_interval() {
    let mut engine = test_engine();

    engine
        .recur(RecurRequest::new("reports", 60).jid("nightly"), at(0))
        .unwrap();

    // due immediately: one spawn
    let spawned = engine.tick_recurring("reports", at(0)).unwrap();
    assert_eq!(spawned, vec![Jid::from("nightly-0")]);

    // five intervals elapsed since the next due time (60): five more
    let spawned = engine.tick_recurring("reports", at(305)).unwrap();
    assert_eq!(spawned.len(), 5);
    assert_eq!(spawned[0].as_str(), "nightly-1");
    assert_eq!(spawned[4].as_str(), "nightly-5");

    // nothing more until 360
    assert!(engine.tick_recurring("reports", at(310)).unwrap().is_empty());
    assert_eq!(engine.tick_recurring("reports", at(360)).unwrap().len(), 1);
}

#[test]
fn offset_delays_the_first_spawn() {
    let mut engine = test_engine();

    engine
        .recur(RecurRequest::new("q", 60).jid("later").offset(30), at(0))
        .unwrap();

    assert!(engine.tick_recurring("q", at(29)).unwrap().is_empty());
    assert_eq!(engine.tick_recurring("q", at(30)).unwrap().len(), 1);
}

#[test]
fn pop_spawns_due_instances_implicitly() {
    let mut engine = test_engine();

    engine
        .recur(
            RecurRequest::new("q", 60)
                .jid("tick")
                .data(json!({"kind": "heartbeat"})),
            at(0),
        )
        .unwrap();

    let popped = engine.pop("q", "w", 1, at(5)).unwrap();
    assert_eq!(popped.len(), 1);
    assert_eq!(popped[0].jid.as_str(), "tick-0");
    assert_eq!(popped[0].state, JobState::Running);
    assert_eq!(popped[0].data, json!({"kind": "heartbeat"}));
    assert_eq!(popped[0].spawned_from, Some(Jid::from("tick")));
}

// ---------------------------------------------------------------------------
// Template snapshots
// ---------------------------------------------------------------------------

#[test]
fn instances_snapshot_the_template_at_spawn_time() {
    let mut engine = test_engine();

    let template = engine
        .recur(
            RecurRequest::new("q", 60)
                .jid("job")
                .data(json!({"v": 1}))
                .retries(2),
            at(0),
        )
        .unwrap();

    engine.tick_recurring("q", at(0)).unwrap();

    engine
        .recur_update(
            &template,
            RecurUpdate {
                data: Some(json!({"v": 2})),
                ..Default::default()
            },
        )
        .unwrap();

    engine.tick_recurring("q", at(60)).unwrap();

    let first = engine.get(&Jid::from("job-0")).unwrap().unwrap();
    let second = engine.get(&Jid::from("job-1")).unwrap().unwrap();
    assert_eq!(first.data, json!({"v": 1}));
    assert_eq!(second.data, json!({"v": 2}));
    assert_eq!(first.remaining, 2);
}

#[test]
fn instances_inherit_template_tags() {
    let mut engine = test_engine();

    engine
        .recur(
            RecurRequest::new("q", 60)
                .jid("tagged")
                .tags(vec!["cron".into()]),
            at(0),
        )
        .unwrap();
    engine.tick_recurring("q", at(0)).unwrap();

    let jids = engine.tagged("cron").unwrap();
    assert_eq!(jids, vec![Jid::from("tagged-0")]);
}

#[test]
fn interval_update_changes_future_cadence() {
    let mut engine = test_engine();

    let template = engine
        .recur(RecurRequest::new("q", 60).jid("job"), at(0))
        .unwrap();
    engine.tick_recurring("q", at(0)).unwrap();

    engine
        .recur_update(
            &template,
            RecurUpdate {
                interval: Some(10),
                ..Default::default()
            },
        )
        .unwrap();

    // next spawn still due at 60 (already scheduled), then every 10s
    assert_eq!(engine.tick_recurring("q", at(60)).unwrap().len(), 1);
    assert_eq!(engine.tick_recurring("q", at(70)).unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Registration and removal
// ---------------------------------------------------------------------------

#[test]
fn recur_refuses_a_jid_already_in_use() {
    let mut engine = test_engine();

    engine
        .recur(RecurRequest::new("q", 60).jid("taken"), at(0))
        .unwrap();
    let err = engine
        .recur(RecurRequest::new("q", 60).jid("taken"), at(1))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateJob(_)));
}

#[test]
fn unrecur_stops_future_spawns_but_keeps_instances() {
    let mut engine = test_engine();

    let template = engine
        .recur(RecurRequest::new("q", 60).jid("job"), at(0))
        .unwrap();
    engine.tick_recurring("q", at(0)).unwrap();

    engine.unrecur(&template).unwrap();
    assert!(engine.recur_get(&template).unwrap().is_none());
    assert!(engine.tick_recurring("q", at(120)).unwrap().is_empty());

    // the already-spawned instance survives
    assert!(engine.get(&Jid::from("job-0")).unwrap().is_some());
}

#[test]
fn unrecur_of_an_unknown_template_is_an_error() {
    let mut engine = test_engine();
    let err = engine.unrecur(&Jid::from("ghost")).unwrap_err();
    assert!(matches!(err, Error::UnknownRecurringJob(_)));
}

#[test]
fn recurring_templates_count_toward_their_queue() {
    let mut engine = test_engine();

    engine
        .recur(RecurRequest::new("q", 60).jid("job").offset(600), at(0))
        .unwrap();
    let counts = engine.counts("q", at(0)).unwrap();
    assert_eq!(counts.recurring, 1);
    assert_eq!(counts.waiting, 0);
}
