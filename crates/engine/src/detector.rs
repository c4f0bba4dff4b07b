use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use labelsync_core::{ClockOrdering, RecordId, VectorClock};
use labelsync_storage::LabeledRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConflictDescriptor {
    /// The incoming clock neither follows nor precedes the session's clock.
    ConcurrentModification {
        current_clock: VectorClock,
        incoming_clock: VectorClock,
    },
    /// Records for one `data_id` disagree on the label.
    LabelConflict {
        data_id: String,
        labels: BTreeSet<String>,
        record_ids: Vec<RecordId>,
    },
}

/// Two records of the same session whose clocks are causally concurrent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClockIssue {
    pub first: RecordId,
    pub second: RecordId,
    pub first_data_id: String,
    pub second_data_id: String,
}

/// Compare an incoming write clock against the session's last known clock.
/// With no prior clock there is nothing to conflict with.
pub fn detect_conflicts(current: Option<&VectorClock>, incoming: &VectorClock) -> Vec<ConflictDescriptor> {
    let Some(current) = current else {
        return Vec::new();
    };
    match current.compare(incoming) {
        ClockOrdering::Concurrent => vec![ConflictDescriptor::ConcurrentModification {
            current_clock: current.clone(),
            incoming_clock: incoming.clone(),
        }],
        ClockOrdering::Before | ClockOrdering::After | ClockOrdering::Equal => Vec::new(),
    }
}

/// One descriptor per `data_id` whose records carry more than one distinct label.
/// Output is ordered by `data_id`; record ids keep input order.
pub fn detect_label_conflicts(records: &[LabeledRecord]) -> Vec<ConflictDescriptor> {
    let mut groups: BTreeMap<&str, (BTreeSet<String>, Vec<RecordId>)> = BTreeMap::new();
    for record in records {
        let (labels, ids) = groups.entry(record.data_id.as_str()).or_default();
        labels.insert(record.label.clone());
        ids.push(record.record_id);
    }

    groups
        .into_iter()
        .filter(|(_, (labels, _))| labels.len() > 1)
        .map(|(data_id, (labels, record_ids))| ConflictDescriptor::LabelConflict {
            data_id: data_id.to_string(),
            labels,
            record_ids,
        })
        .collect()
}

/// Every pair of records whose clocks are concurrent.
pub fn check_clock_consistency(records: &[LabeledRecord]) -> Vec<ClockIssue> {
    let mut issues = Vec::new();
    for (i, a) in records.iter().enumerate() {
        for b in &records[i + 1..] {
            if a.vector_clock.compare(&b.vector_clock) == ClockOrdering::Concurrent {
                issues.push(ClockIssue {
                    first: a.record_id,
                    second: b.record_id,
                    first_data_id: a.data_id.clone(),
                    second_data_id: b.data_id.clone(),
                });
            }
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelsync_core::{Confidence, Hlc, SessionId};
    use labelsync_storage::ResolutionStatus;

    fn vc(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|(n, c)| (*n, *c)).collect()
    }

    fn record(id: i64, data_id: &str, label: &str, clock: VectorClock) -> LabeledRecord {
        LabeledRecord {
            record_id: RecordId::new(id),
            session_id: SessionId::new(),
            annotator_id: "ann".into(),
            data_id: data_id.into(),
            original_text: String::new(),
            label: label.into(),
            confidence: Confidence::new(0.5).unwrap(),
            vector_clock: clock,
            is_conflict: false,
            conflict_resolution: ResolutionStatus::Pending,
            created_at: Hlc::new(1, 0),
            updated_at: Hlc::new(1, 0),
        }
    }

    #[test]
    fn concurrent_clocks_yield_one_descriptor() {
        let a = vc(&[("n1", 1), ("n2", 0)]);
        let b = vc(&[("n1", 0), ("n2", 1)]);
        let found = detect_conflicts(Some(&a), &b);
        assert_eq!(
            found,
            vec![ConflictDescriptor::ConcurrentModification {
                current_clock: a,
                incoming_clock: b,
            }]
        );
    }

    #[test]
    fn ordered_or_missing_clocks_are_not_conflicts() {
        let base = vc(&[("n1", 1)]);
        assert!(detect_conflicts(None, &base).is_empty());
        assert!(detect_conflicts(Some(&base), &base).is_empty());
        assert!(detect_conflicts(Some(&base), &base.increment("n1")).is_empty());
        assert!(detect_conflicts(Some(&base.increment("n1")), &base).is_empty());
        // an empty prior clock is all zeros, not "no history"
        assert!(detect_conflicts(Some(&VectorClock::new()), &base).is_empty());
    }

    #[test]
    fn diverging_labels_on_one_data_id() {
        let records = vec![
            record(1, "d1", "positive", vc(&[("n1", 1)])),
            record(2, "d1", "negative", vc(&[("n1", 2)])),
            record(3, "d2", "neutral", vc(&[("n1", 3)])),
            record(4, "d2", "neutral", vc(&[("n1", 4)])),
        ];
        let found = detect_label_conflicts(&records);
        assert_eq!(found.len(), 1);
        match &found[0] {
            ConflictDescriptor::LabelConflict { data_id, labels, record_ids } => {
                assert_eq!(data_id, "d1");
                assert_eq!(
                    labels.iter().map(String::as_str).collect::<Vec<_>>(),
                    vec!["negative", "positive"]
                );
                assert_eq!(record_ids, &vec![RecordId::new(1), RecordId::new(2)]);
            }
            other => panic!("unexpected descriptor {other:?}"),
        }
    }

    #[test]
    fn pairwise_concurrency_is_reported_once_per_pair() {
        let records = vec![
            record(1, "d1", "a", vc(&[("n1", 1)])),
            record(2, "d2", "b", vc(&[("n2", 1)])),
            record(3, "d3", "c", vc(&[("n1", 1), ("n2", 1)])),
        ];
        let issues = check_clock_consistency(&records);
        assert_eq!(issues.len(), 1);
        assert_eq!((issues[0].first, issues[0].second), (RecordId::new(1), RecordId::new(2)));
    }
}
