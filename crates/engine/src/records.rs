use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use labelsync_core::{Confidence, Hlc, RecordId, ReplicaId, SessionId, VectorClock};
use labelsync_storage::{ConflictCounts, LabeledRecord, NewRecord, RecordUpdate, ReplicaStore, StorageError};

use crate::EngineError;
use crate::clocks::{ClockStore, Timestamps};
use crate::detector::detect_conflicts;
use crate::metrics::{EngineEvent, MetricsSink};
use crate::router::ReplicaRouter;

/// One label submission.
#[derive(Debug, Clone)]
pub struct NewLabel {
    pub data_id: String,
    pub original_text: String,
    pub label: String,
    pub confidence: Confidence,
    pub vector_clock: VectorClock,
}

/// Partial update of a label. `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct LabelPatch {
    pub label: Option<String>,
    pub confidence: Option<Confidence>,
    pub vector_clock: Option<VectorClock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelingStats {
    pub total_labels: usize,
    pub conflicts: usize,
    pub label_distribution: BTreeMap<String, usize>,
    /// `None` when there are no labels.
    pub mean_confidence: Option<f64>,
    /// Most recent `updated_at` among the labels.
    pub last_activity: Option<Hlc>,
}

impl LabelingStats {
    fn from_records(records: &[LabeledRecord]) -> Self {
        let mut label_distribution = BTreeMap::new();
        for record in records {
            *label_distribution.entry(record.label.clone()).or_insert(0) += 1;
        }
        let mean_confidence = if records.is_empty() {
            None
        } else {
            let total: f64 = records.iter().map(|r| r.confidence.value()).sum();
            Some(total / records.len() as f64)
        };
        Self {
            total_labels: records.len(),
            conflicts: records.iter().filter(|r| r.is_conflict).count(),
            label_distribution,
            mean_confidence,
            last_activity: records.iter().map(|r| r.updated_at).max(),
        }
    }
}

/// Lifecycle of labeled records and the session clocks they advance.
///
/// Writes are never refused because of concurrency: a write whose clock is
/// concurrent with the session's clock is stored with `is_conflict` set, and
/// the session clock is merged either way.
pub struct LabelingRecordStore {
    router: Arc<ReplicaRouter>,
    clocks: Arc<ClockStore>,
    timestamps: Arc<Timestamps>,
    metrics: Arc<dyn MetricsSink>,
}

fn check_text(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

impl NewLabel {
    fn validate(&self) -> Result<(), EngineError> {
        check_text("data_id", &self.data_id)?;
        check_text("label", &self.label)
    }
}

impl LabelingRecordStore {
    pub fn new(
        router: Arc<ReplicaRouter>,
        clocks: Arc<ClockStore>,
        timestamps: Arc<Timestamps>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            router,
            clocks,
            timestamps,
            metrics,
        }
    }

    /// The session's last known clock. Loaded from the primary on a cache
    /// miss; `None` when the session exists but never recorded a clock.
    fn prior_clock(&self, primary: &dyn ReplicaStore, session_id: SessionId) -> Result<Option<VectorClock>, EngineError> {
        if let Some(clock) = self.clocks.get(session_id) {
            return Ok(Some(clock));
        }
        match primary.get_session_clock(session_id)? {
            Some(stored) => Ok(Some(self.clocks.merge(session_id, &stored))),
            None => {
                if primary.get_session(session_id)?.is_none() {
                    return Err(EngineError::SessionNotFound(session_id));
                }
                Ok(None)
            }
        }
    }

    fn report_conflict(&self, record: &LabeledRecord) {
        warn!(
            session_id = %record.session_id,
            record_id = %record.record_id,
            data_id = %record.data_id,
            "concurrent modification recorded as conflict"
        );
        self.metrics.increment_counter("conflicts.detected", 1);
        self.metrics.record_event(EngineEvent::ConflictDetected {
            session_id: record.session_id,
            data_id: record.data_id.clone(),
            record_id: record.record_id,
        });
    }

    pub fn create(&self, session_id: SessionId, annotator_id: &str, label: NewLabel) -> Result<LabeledRecord, EngineError> {
        let mut created = self.batch_create(session_id, annotator_id, vec![label])?;
        created
            .pop()
            .ok_or_else(|| StorageError::Serialization("insert returned no record".into()).into())
    }

    /// All items persist or none do. Each item is checked against the clock
    /// as advanced by the items before it.
    pub fn batch_create(
        &self,
        session_id: SessionId,
        annotator_id: &str,
        items: Vec<NewLabel>,
    ) -> Result<Vec<LabeledRecord>, EngineError> {
        check_text("annotator_id", annotator_id)?;
        for item in &items {
            item.validate()?;
        }
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let primary = self.router.primary_store()?;
        let mut running = self.prior_clock(primary, session_id)?;
        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            let is_conflict = !detect_conflicts(running.as_ref(), &item.vector_clock).is_empty();
            running = Some(match running {
                Some(clock) => clock.merge(&item.vector_clock),
                None => item.vector_clock.clone(),
            });
            rows.push(NewRecord {
                session_id,
                annotator_id: annotator_id.to_string(),
                data_id: item.data_id,
                original_text: item.original_text,
                label: item.label,
                confidence: item.confidence,
                vector_clock: item.vector_clock,
                is_conflict,
            });
        }

        let at = self.timestamps.now()?;
        let inserted = primary.insert_records(&rows, at)?;

        for record in &inserted {
            self.clocks.merge(session_id, &record.vector_clock);
            if record.is_conflict {
                self.report_conflict(record);
            }
        }
        debug!(session_id = %session_id, count = inserted.len(), "labels stored");
        Ok(inserted)
    }

    /// Partial update. A new clock is conflict-checked like a fresh write and
    /// may raise `is_conflict`; only resolution clears it.
    pub fn update(&self, record_id: RecordId, patch: LabelPatch) -> Result<LabeledRecord, EngineError> {
        if let Some(label) = &patch.label {
            check_text("label", label)?;
        }

        let primary = self.router.primary_store()?;
        let current = primary
            .get_record(record_id)?
            .ok_or(EngineError::RecordNotFound(record_id))?;

        let mark_conflict = match &patch.vector_clock {
            Some(clock) => {
                let prior = self.prior_clock(primary, current.session_id)?;
                !detect_conflicts(prior.as_ref(), clock).is_empty()
            }
            None => false,
        };

        let update = RecordUpdate {
            label: patch.label,
            confidence: patch.confidence,
            vector_clock: patch.vector_clock,
            mark_conflict,
        };
        let at = self.timestamps.now()?;
        let updated = primary
            .update_record(record_id, &update, at)?
            .ok_or(EngineError::RecordNotFound(record_id))?;

        if let Some(clock) = &update.vector_clock {
            self.clocks.merge(current.session_id, clock);
        }
        if mark_conflict {
            self.report_conflict(&updated);
        }
        Ok(updated)
    }

    pub fn list_by_session(
        &self,
        session_id: SessionId,
        pinned: Option<&ReplicaId>,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<LabeledRecord>, EngineError> {
        self.router
            .with_read(pinned, |store| store.list_records(session_id, limit, offset))
    }

    pub fn list_conflicts(&self, session_id: SessionId, pinned: Option<&ReplicaId>) -> Result<Vec<LabeledRecord>, EngineError> {
        self.router
            .with_read(pinned, |store| store.list_conflicts(Some(session_id)))
    }

    pub fn session_stats(&self, session_id: SessionId, pinned: Option<&ReplicaId>) -> Result<LabelingStats, EngineError> {
        let records = self.list_by_session(session_id, pinned, None, 0)?;
        Ok(LabelingStats::from_records(&records))
    }

    /// Labels of one annotator across all of their sessions.
    pub fn annotator_stats(&self, annotator_id: &str) -> Result<LabelingStats, EngineError> {
        let records = self
            .router
            .with_read(None, |store| store.records_by_annotator(annotator_id))?;
        Ok(LabelingStats::from_records(&records))
    }

    pub fn conflict_counts(&self) -> Result<ConflictCounts, EngineError> {
        self.router.with_read(None, |store| store.conflict_counts())
    }
}
