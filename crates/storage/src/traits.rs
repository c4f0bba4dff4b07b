use serde::Serialize;

use labelsync_core::{Confidence, Hlc, RecordId, ReplicaId, SessionId, VectorClock};

use crate::error::StorageError;

/// Where a labeled record stands with respect to conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Pending,
    LastWriteWins,
    ConfidenceBased,
    Manual,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::LastWriteWins => "last_write_wins",
            Self::ConfidenceBased => "confidence_based",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "pending" => Ok(Self::Pending),
            "last_write_wins" => Ok(Self::LastWriteWins),
            "confidence_based" => Ok(Self::ConfidenceBased),
            "manual" => Ok(Self::Manual),
            _ => Err(StorageError::Serialization(format!("unknown resolution status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub annotator_id: String,
    pub current_replica: ReplicaId,
    pub is_active: bool,
    pub created_at: Hlc,
    pub last_activity: Hlc,
    pub ended_at: Option<Hlc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledRecord {
    pub record_id: RecordId,
    pub session_id: SessionId,
    pub annotator_id: String,
    pub data_id: String,
    pub original_text: String,
    pub label: String,
    pub confidence: Confidence,
    pub vector_clock: VectorClock,
    pub is_conflict: bool,
    pub conflict_resolution: ResolutionStatus,
    pub created_at: Hlc,
    pub updated_at: Hlc,
}

/// A record about to be written. `is_conflict` is decided by the caller.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub session_id: SessionId,
    pub annotator_id: String,
    pub data_id: String,
    pub original_text: String,
    pub label: String,
    pub confidence: Confidence,
    pub vector_clock: VectorClock,
    pub is_conflict: bool,
}

/// Partial update of a record. `None` fields are left as they are.
/// `mark_conflict` can only raise the conflict flag, never clear it.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub label: Option<String>,
    pub confidence: Option<Confidence>,
    pub vector_clock: Option<VectorClock>,
    pub mark_conflict: bool,
}

/// Everything needed to settle one `data_id` group, applied in a single
/// transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupResolution {
    pub data_id: String,
    pub status: ResolutionStatus,
    pub survivor: Option<RecordId>,
    /// Records removed from the live table.
    pub delete: Vec<RecordId>,
    /// Records whose conflict flag is cleared and whose status is set.
    pub mark: Vec<RecordId>,
    /// Label applied to one record before marking (manual resolution).
    pub relabel: Option<(RecordId, String)>,
}

/// Decides how a group is settled from its current records.
pub type GroupPlanner<'a> = &'a dyn Fn(&[LabeledRecord]) -> Option<GroupResolution>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictCounts {
    pub flagged: u64,
    pub flagged_by_session: Vec<(SessionId, u64)>,
    pub by_resolution: Vec<(ResolutionStatus, u64)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub sessions: u64,
    pub records: u64,
}

/// Session-scoped read/write access to one replica.
///
/// Secondaries only ever see the read methods; the engine sends every
/// mutation to the primary.
pub trait ReplicaStore: Send + Sync {
    /// Lightweight connectivity check.
    fn ping(&self) -> Result<(), StorageError>;

    fn insert_session(&self, session: &SessionRecord, clock: &VectorClock) -> Result<(), StorageError>;

    fn get_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StorageError>;

    fn list_sessions(&self, active_only: bool) -> Result<Vec<SessionRecord>, StorageError>;

    /// Returns false when the session does not exist.
    fn set_session_replica(
        &self,
        session_id: SessionId,
        replica: &ReplicaId,
        at: Hlc,
    ) -> Result<bool, StorageError>;

    fn touch_session(&self, session_id: SessionId, at: Hlc) -> Result<bool, StorageError>;

    fn deactivate_session(&self, session_id: SessionId, at: Hlc) -> Result<bool, StorageError>;

    /// Deactivate every active session whose last activity is before
    /// `idle_before`. Returns the affected ids.
    fn deactivate_idle_sessions(
        &self,
        idle_before: Hlc,
        at: Hlc,
    ) -> Result<Vec<SessionId>, StorageError>;

    /// The persisted session clock, `None` when nothing was ever recorded.
    fn get_session_clock(&self, session_id: SessionId) -> Result<Option<VectorClock>, StorageError>;

    /// Insert all records or none. Each record's clock is merged into its
    /// session clock and the session's activity is touched in the same
    /// transaction.
    fn insert_records(&self, records: &[NewRecord], at: Hlc) -> Result<Vec<LabeledRecord>, StorageError>;

    fn get_record(&self, record_id: RecordId) -> Result<Option<LabeledRecord>, StorageError>;

    /// Returns `None` when the record does not exist.
    fn update_record(
        &self,
        record_id: RecordId,
        update: &RecordUpdate,
        at: Hlc,
    ) -> Result<Option<LabeledRecord>, StorageError>;

    /// Records of a session in insertion order. `limit: None` means all.
    fn list_records(
        &self,
        session_id: SessionId,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<LabeledRecord>, StorageError>;

    /// Records flagged `is_conflict`, for one session or all of them.
    fn list_conflicts(&self, session_id: Option<SessionId>) -> Result<Vec<LabeledRecord>, StorageError>;

    /// Every live record for `data_id`, optionally restricted to one session.
    fn records_for_data_id(
        &self,
        data_id: &str,
        session_id: Option<SessionId>,
    ) -> Result<Vec<LabeledRecord>, StorageError>;

    /// Settle one `data_id` group in a single write transaction: the group is
    /// read, handed to `plan`, and the returned resolution applied before
    /// anyone else can change it. `None` from `plan` commits nothing.
    /// With `archive`, deleted records are copied to the archive table first.
    fn resolve_group(
        &self,
        data_id: &str,
        session_id: Option<SessionId>,
        plan: GroupPlanner<'_>,
        archive: bool,
        at: Hlc,
    ) -> Result<Option<GroupResolution>, StorageError>;

    /// Every live record written by one annotator, across sessions.
    fn records_by_annotator(&self, annotator_id: &str) -> Result<Vec<LabeledRecord>, StorageError>;

    /// Flagged records per session, and resolution outcomes of every record
    /// that is or was part of a conflict.
    fn conflict_counts(&self) -> Result<ConflictCounts, StorageError>;

    /// Remove inactive sessions last active before `cutoff` and
    /// non-conflicting records created before it.
    fn purge_before(&self, cutoff: Hlc) -> Result<PurgeCounts, StorageError>;
}
