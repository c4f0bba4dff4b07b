use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use labelsync_core::{Hlc, RecordId, ReplicaId, SessionId, VectorClock};
use labelsync_storage::{
    ConflictCounts, GroupPlanner, GroupResolution, LabeledRecord, NewRecord, PurgeCounts, RecordUpdate,
    ReplicaStore, SqliteReplica, SessionRecord, StorageError,
};

/// A replica that can be switched off. While down, every call fails with
/// `StorageError::Unavailable` before reaching SQLite.
pub struct FlakyReplica {
    name: String,
    inner: SqliteReplica,
    down: AtomicBool,
    calls: AtomicUsize,
    resolution_gate: Mutex<Option<Arc<Barrier>>>,
}

impl FlakyReplica {
    pub fn new(name: &str, inner: SqliteReplica) -> Self {
        Self {
            name: name.to_string(),
            inner,
            down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            resolution_gate: Mutex::new(None),
        }
    }

    /// Hold every group resolution at `barrier` until enough callers are in
    /// flight, so tests can line up concurrent resolutions.
    pub fn gate_resolutions(&self, barrier: Arc<Barrier>) {
        *self.resolution_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(barrier);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Calls that reached SQLite, pings included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<&SqliteReplica, StorageError> {
        if self.is_down() {
            return Err(StorageError::Unavailable(format!("{} is down", self.name)));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(&self.inner)
    }
}

impl ReplicaStore for FlakyReplica {
    fn ping(&self) -> Result<(), StorageError> {
        self.check()?.ping()
    }

    fn insert_session(&self, session: &SessionRecord, clock: &VectorClock) -> Result<(), StorageError> {
        self.check()?.insert_session(session, clock)
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StorageError> {
        self.check()?.get_session(session_id)
    }

    fn list_sessions(&self, active_only: bool) -> Result<Vec<SessionRecord>, StorageError> {
        self.check()?.list_sessions(active_only)
    }

    fn set_session_replica(&self, session_id: SessionId, replica: &ReplicaId, at: Hlc) -> Result<bool, StorageError> {
        self.check()?.set_session_replica(session_id, replica, at)
    }

    fn touch_session(&self, session_id: SessionId, at: Hlc) -> Result<bool, StorageError> {
        self.check()?.touch_session(session_id, at)
    }

    fn deactivate_session(&self, session_id: SessionId, at: Hlc) -> Result<bool, StorageError> {
        self.check()?.deactivate_session(session_id, at)
    }

    fn deactivate_idle_sessions(&self, idle_before: Hlc, at: Hlc) -> Result<Vec<SessionId>, StorageError> {
        self.check()?.deactivate_idle_sessions(idle_before, at)
    }

    fn get_session_clock(&self, session_id: SessionId) -> Result<Option<VectorClock>, StorageError> {
        self.check()?.get_session_clock(session_id)
    }

    fn insert_records(&self, records: &[NewRecord], at: Hlc) -> Result<Vec<LabeledRecord>, StorageError> {
        self.check()?.insert_records(records, at)
    }

    fn get_record(&self, record_id: RecordId) -> Result<Option<LabeledRecord>, StorageError> {
        self.check()?.get_record(record_id)
    }

    fn update_record(&self, record_id: RecordId, update: &RecordUpdate, at: Hlc) -> Result<Option<LabeledRecord>, StorageError> {
        self.check()?.update_record(record_id, update, at)
    }

    fn list_records(&self, session_id: SessionId, limit: Option<u32>, offset: u32) -> Result<Vec<LabeledRecord>, StorageError> {
        self.check()?.list_records(session_id, limit, offset)
    }

    fn list_conflicts(&self, session_id: Option<SessionId>) -> Result<Vec<LabeledRecord>, StorageError> {
        self.check()?.list_conflicts(session_id)
    }

    fn records_for_data_id(&self, data_id: &str, session_id: Option<SessionId>) -> Result<Vec<LabeledRecord>, StorageError> {
        self.check()?.records_for_data_id(data_id, session_id)
    }

    fn resolve_group(
        &self,
        data_id: &str,
        session_id: Option<SessionId>,
        plan: GroupPlanner<'_>,
        archive: bool,
        at: Hlc,
    ) -> Result<Option<GroupResolution>, StorageError> {
        let gate = self.resolution_gate.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(barrier) = gate {
            barrier.wait();
        }
        self.check()?.resolve_group(data_id, session_id, plan, archive, at)
    }

    fn records_by_annotator(&self, annotator_id: &str) -> Result<Vec<LabeledRecord>, StorageError> {
        self.check()?.records_by_annotator(annotator_id)
    }

    fn conflict_counts(&self) -> Result<ConflictCounts, StorageError> {
        self.check()?.conflict_counts()
    }

    fn purge_before(&self, cutoff: Hlc) -> Result<PurgeCounts, StorageError> {
        self.check()?.purge_before(cutoff)
    }
}
