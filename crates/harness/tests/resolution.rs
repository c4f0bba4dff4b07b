use std::sync::{Arc, Barrier};
use std::thread;

use labelsync_core::SessionId;
use labelsync_engine::{EngineConfig, EngineError, ResolutionScope, ResolutionStrategy};
use labelsync_harness::{TestCluster, new_label};
use labelsync_storage::{LabeledRecord, ResolutionStatus};

/// Three labels for `d1` where the second and third arrive with clocks
/// concurrent to the session's.
fn three_way_conflict(
    cluster: &TestCluster,
    confidences: [f64; 3],
) -> Result<(SessionId, Vec<LabeledRecord>), Box<dyn std::error::Error>> {
    let engine = &cluster.engine;
    let sid = engine.create_session("ann-1")?.session_id;
    let records = vec![
        engine.create_label(sid, "ann-1", new_label("d1", "positive", confidences[0], &[("a", 1)]))?,
        engine.create_label(sid, "ann-1", new_label("d1", "negative", confidences[1], &[("b", 1)]))?,
        engine.create_label(sid, "ann-1", new_label("d1", "neutral", confidences[2], &[("c", 1)]))?,
    ];
    assert_eq!(
        records.iter().map(|r| r.is_conflict).collect::<Vec<_>>(),
        vec![false, true, true]
    );
    Ok((sid, records))
}

#[test]
fn last_write_wins_keeps_one_survivor() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new(1)?;
    let engine = &cluster.engine;
    let (sid, records) = three_way_conflict(&cluster, [0.9, 0.8, 0.1])?;

    let outcome = engine.resolve_conflict(records[1].record_id, "last_write_wins", None)?;
    assert_eq!(outcome.strategy, ResolutionStrategy::LastWriteWins);
    assert_eq!(outcome.groups, 1);
    assert_eq!(outcome.deleted, 2);

    let left = engine.list_labels(sid, None, 0)?;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].record_id, records[2].record_id);
    assert!(!left[0].is_conflict);
    assert_eq!(left[0].conflict_resolution, ResolutionStatus::LastWriteWins);
    assert!(engine.list_conflicts(sid)?.is_empty());

    assert_eq!(engine.metrics().events_named("conflicts_resolved").count(), 1);
    Ok(())
}

#[test]
fn resolving_twice_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new(1)?;
    let engine = &cluster.engine;
    let (sid, records) = three_way_conflict(&cluster, [0.5, 0.5, 0.5])?;

    engine.resolve_conflict(records[2].record_id, "last_write_wins", None)?;
    let again = engine.resolve_conflict(records[2].record_id, "last_write_wins", None)?;
    assert_eq!(again.groups, 0);
    assert_eq!(again.deleted, 0);

    let session_wide = engine.resolve_session_conflicts(sid, "confidence_based")?;
    assert_eq!(session_wide.groups, 0);
    assert_eq!(engine.list_labels(sid, None, 0)?.len(), 1);
    Ok(())
}

#[test]
fn confidence_based_keeps_the_most_confident() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new(1)?;
    let engine = &cluster.engine;
    let (sid, records) = three_way_conflict(&cluster, [0.95, 0.4, 0.7])?;

    let outcome = engine.resolve_conflict(records[2].record_id, "confidence_based", None)?;
    assert_eq!(outcome.deleted, 2);

    let left = engine.list_labels(sid, None, 0)?;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].record_id, records[0].record_id);
    assert_eq!(left[0].conflict_resolution, ResolutionStatus::ConfidenceBased);
    Ok(())
}

#[test]
fn manual_resolution_applies_the_chosen_label() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new(1)?;
    let engine = &cluster.engine;
    let (sid, records) = three_way_conflict(&cluster, [0.5, 0.5, 0.5])?;

    let outcome = engine.resolve_conflict(records[1].record_id, "manual_resolution", Some("sarcasm"))?;
    assert_eq!(outcome.deleted, 0);
    assert_eq!(outcome.cleared, 2);

    let left = engine.list_labels(sid, None, 0)?;
    assert_eq!(left.len(), 3);
    assert!(left.iter().all(|r| !r.is_conflict));
    let chosen = left.iter().find(|r| r.record_id == records[1].record_id).ok_or("missing record")?;
    assert_eq!(chosen.label, "sarcasm");
    assert_eq!(chosen.conflict_resolution, ResolutionStatus::Manual);
    let untouched = left.iter().find(|r| r.record_id == records[0].record_id).ok_or("missing record")?;
    assert_eq!(untouched.label, "positive");
    assert_eq!(untouched.conflict_resolution, ResolutionStatus::Pending);
    Ok(())
}

#[test]
fn unknown_strategy_changes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new(1)?;
    let engine = &cluster.engine;
    let (sid, records) = three_way_conflict(&cluster, [0.5, 0.5, 0.5])?;

    let err = engine
        .resolve_conflict(records[1].record_id, "most_popular", None)
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownStrategy(name) if name == "most_popular"));
    assert!(matches!(
        engine.resolve_session_conflicts(sid, "").unwrap_err(),
        EngineError::UnknownStrategy(_)
    ));
    assert_eq!(engine.list_conflicts(sid)?.len(), 2);
    assert_eq!(engine.list_labels(sid, None, 0)?.len(), 3);
    Ok(())
}

#[test]
fn missing_record_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new(0)?;
    let err = cluster
        .engine
        .resolve_conflict(labelsync_core::RecordId::new(404), "manual", None)
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[test]
fn session_wide_resolution_covers_every_group() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new(1)?;
    let engine = &cluster.engine;
    let sid = engine.create_session("ann-1")?.session_id;

    engine.create_label(sid, "ann-1", new_label("d1", "positive", 0.5, &[("a", 1)]))?;
    engine.create_label(sid, "ann-1", new_label("d1", "negative", 0.5, &[("b", 1)]))?;
    engine.create_label(sid, "ann-1", new_label("d2", "positive", 0.5, &[("c", 1)]))?;
    engine.create_label(sid, "ann-1", new_label("d2", "negative", 0.5, &[("d", 1)]))?;
    engine.create_label(sid, "ann-1", new_label("d3", "positive", 0.5, &[("a", 2), ("b", 1), ("c", 1), ("d", 1)]))?;
    assert_eq!(engine.list_conflicts(sid)?.len(), 3);

    let outcome = engine.resolve_session_conflicts(sid, "last_write_wins")?;
    assert_eq!(outcome.groups, 2);
    assert_eq!(outcome.deleted, 2);
    assert!(engine.list_conflicts(sid)?.is_empty());

    let data_ids: Vec<String> = engine
        .list_labels(sid, None, 0)?
        .into_iter()
        .map(|r| r.data_id)
        .collect();
    assert_eq!(data_ids, vec!["d1", "d2", "d3"]);
    Ok(())
}

#[test]
fn scope_decides_whether_other_sessions_take_part() -> Result<(), Box<dyn std::error::Error>> {
    for (scope, other_left) in [(ResolutionScope::Session, 1), (ResolutionScope::Global, 0)] {
        let mut config = EngineConfig::default();
        config.resolution.scope = scope;
        config.resolution.archive_resolved = true;
        let cluster = TestCluster::with_config(1, config)?;
        let engine = &cluster.engine;

        let other = engine.create_session("ann-2")?.session_id;
        engine.create_label(other, "ann-2", new_label("d1", "positive", 0.5, &[("x", 1)]))?;

        let (sid, records) = three_way_conflict(&cluster, [0.5, 0.5, 0.5])?;
        engine.resolve_conflict(records[1].record_id, "last_write_wins", None)?;

        assert_eq!(engine.list_labels(sid, None, 0)?.len(), 1, "{scope:?}");
        assert_eq!(engine.list_labels(other, None, 0)?.len(), other_left, "{scope:?}");
    }
    Ok(())
}

#[test]
fn concurrent_resolutions_leave_one_survivor() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new(1)?;
    let engine = &cluster.engine;
    // newest is records[2], most confident is records[0]
    let (sid, records) = three_way_conflict(&cluster, [0.9, 0.4, 0.1])?;

    // both resolutions are in flight before either reaches the store
    cluster.replica("primary").gate_resolutions(Arc::new(Barrier::new(2)));
    let (lww, conf) = thread::scope(|s| {
        let lww = s.spawn(|| engine.resolve_conflict(records[1].record_id, "last_write_wins", None));
        let conf = s.spawn(|| engine.resolve_conflict(records[2].record_id, "confidence_based", None));
        (lww.join(), conf.join())
    });
    let lww = lww.map_err(|_| "resolver thread panicked")??;
    let conf = conf.map_err(|_| "resolver thread panicked")??;

    assert_eq!(lww.groups + conf.groups, 1);
    assert_eq!(lww.deleted + conf.deleted, 2);

    let left = engine.list_labels(sid, None, 0)?;
    assert_eq!(left.len(), 1);
    assert!(!left[0].is_conflict);
    assert!(engine.list_conflicts(sid)?.is_empty());
    Ok(())
}
