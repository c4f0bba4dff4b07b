use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior};

use labelsync_core::{Confidence, Hlc, RecordId, ReplicaId, SessionId, VectorClock};

use crate::error::StorageError;
use crate::traits::{
    ConflictCounts, GroupPlanner, GroupResolution, LabeledRecord, NewRecord, PurgeCounts,
    RecordUpdate, ReplicaStore, ResolutionStatus, SessionRecord,
};

const RECORD_COLUMNS: &str = "record_id, session_id, annotator_id, data_id, original_text, label, confidence, vector_clock, is_conflict, conflict_resolution, created_at, updated_at";

const SESSION_COLUMNS: &str =
    "session_id, annotator_id, current_replica, is_active, created_at, last_activity, ended_at";

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn to_hlc(v: Vec<u8>, label: &str) -> Result<Hlc, StorageError> {
    Ok(Hlc::from_bytes(&to_array::<12>(v, label)?))
}

/// SQLite-backed replica. The primary owns the schema; secondaries open the
/// same database file read-only.
pub struct SqliteReplica {
    conn: Mutex<Connection>,
}

impl SqliteReplica {
    /// Open (creating if needed) the writable primary database.
    pub fn open_primary(path: &Path, timeout: Duration) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(timeout)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an existing database read-only.
    pub fn open_secondary(path: &Path, timeout: Duration) -> Result<Self, StorageError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(timeout)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("connection lock poisoned".into()))
    }
}

/// Raw column values of a `labeled_records` row, converted after the
/// statement is done so conversion errors stay `StorageError`s.
struct RecordRow {
    record_id: i64,
    session_id: Vec<u8>,
    annotator_id: String,
    data_id: String,
    original_text: String,
    label: String,
    confidence: f64,
    vector_clock: Vec<u8>,
    is_conflict: bool,
    conflict_resolution: String,
    created_at: Vec<u8>,
    updated_at: Vec<u8>,
}

impl RecordRow {
    fn read(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            record_id: row.get(0)?,
            session_id: row.get(1)?,
            annotator_id: row.get(2)?,
            data_id: row.get(3)?,
            original_text: row.get(4)?,
            label: row.get(5)?,
            confidence: row.get(6)?,
            vector_clock: row.get(7)?,
            is_conflict: row.get(8)?,
            conflict_resolution: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<LabeledRecord, StorageError> {
        Ok(LabeledRecord {
            record_id: RecordId::new(self.record_id),
            session_id: SessionId::from_bytes(to_array::<16>(self.session_id, "session_id")?),
            annotator_id: self.annotator_id,
            data_id: self.data_id,
            original_text: self.original_text,
            label: self.label,
            confidence: Confidence::new(self.confidence)?,
            vector_clock: VectorClock::from_msgpack(&self.vector_clock)?,
            is_conflict: self.is_conflict,
            conflict_resolution: ResolutionStatus::parse(&self.conflict_resolution)?,
            created_at: to_hlc(self.created_at, "created_at")?,
            updated_at: to_hlc(self.updated_at, "updated_at")?,
        })
    }
}

struct SessionRow {
    session_id: Vec<u8>,
    annotator_id: String,
    current_replica: String,
    is_active: bool,
    created_at: Vec<u8>,
    last_activity: Vec<u8>,
    ended_at: Option<Vec<u8>>,
}

impl SessionRow {
    fn read(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            annotator_id: row.get(1)?,
            current_replica: row.get(2)?,
            is_active: row.get(3)?,
            created_at: row.get(4)?,
            last_activity: row.get(5)?,
            ended_at: row.get(6)?,
        })
    }

    fn into_session(self) -> Result<SessionRecord, StorageError> {
        Ok(SessionRecord {
            session_id: SessionId::from_bytes(to_array::<16>(self.session_id, "session_id")?),
            annotator_id: self.annotator_id,
            current_replica: ReplicaId::new(self.current_replica),
            is_active: self.is_active,
            created_at: to_hlc(self.created_at, "created_at")?,
            last_activity: to_hlc(self.last_activity, "last_activity")?,
            ended_at: self.ended_at.map(|b| to_hlc(b, "ended_at")).transpose()?,
        })
    }
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<LabeledRecord>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, RecordRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(RecordRow::into_record).collect()
}

fn fetch_record(conn: &Connection, record_id: RecordId) -> Result<Option<LabeledRecord>, StorageError> {
    let row = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM labeled_records WHERE record_id = ?1"),
            rusqlite::params![record_id.get()],
            RecordRow::read,
        )
        .optional()?;
    row.map(RecordRow::into_record).transpose()
}

fn counter_to_sql(node: &str, counter: u64) -> Result<i64, StorageError> {
    i64::try_from(counter)
        .map_err(|_| StorageError::Serialization(format!("clock counter for {node} exceeds i64")))
}

/// Fold `clock` into the persisted session clock, keeping the max per node.
fn merge_session_clock(
    tx: &rusqlite::Transaction,
    session_id: SessionId,
    clock: &VectorClock,
) -> Result<(), StorageError> {
    for (node, counter) in clock.entries() {
        tx.execute(
            "INSERT INTO session_clocks (session_id, node_id, counter) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id, node_id) DO UPDATE SET counter = excluded.counter
             WHERE excluded.counter > session_clocks.counter",
            rusqlite::params![
                session_id.as_bytes().as_slice(),
                node,
                counter_to_sql(node, *counter)?,
            ],
        )?;
    }
    Ok(())
}

fn group_records(
    conn: &Connection,
    data_id: &str,
    session_id: Option<SessionId>,
) -> Result<Vec<LabeledRecord>, StorageError> {
    match session_id {
        Some(sid) => query_records(
            conn,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM labeled_records WHERE data_id = ?1 AND session_id = ?2 ORDER BY record_id"
            ),
            rusqlite::params![data_id, sid.as_bytes().as_slice()],
        ),
        None => query_records(
            conn,
            &format!("SELECT {RECORD_COLUMNS} FROM labeled_records WHERE data_id = ?1 ORDER BY record_id"),
            rusqlite::params![data_id],
        ),
    }
}

fn apply_group(
    tx: &rusqlite::Transaction,
    resolution: &GroupResolution,
    archive: bool,
    at: Hlc,
) -> Result<(), StorageError> {
    for record_id in &resolution.delete {
        if archive {
            tx.execute(
                "INSERT OR REPLACE INTO resolved_archive (record_id, session_id, annotator_id, data_id, original_text, label, confidence, vector_clock, created_at, updated_at, resolved_at, resolution, survivor_id)
                 SELECT record_id, session_id, annotator_id, data_id, original_text, label, confidence, vector_clock, created_at, updated_at, ?1, ?2, ?3
                 FROM labeled_records WHERE record_id = ?4",
                rusqlite::params![
                    &at.to_bytes()[..],
                    resolution.status.as_str(),
                    resolution.survivor.map(|id| id.get()),
                    record_id.get(),
                ],
            )?;
        }
        tx.execute(
            "DELETE FROM labeled_records WHERE record_id = ?1",
            rusqlite::params![record_id.get()],
        )?;
    }

    if let Some((record_id, label)) = &resolution.relabel {
        tx.execute(
            "UPDATE labeled_records SET label = ?1, updated_at = ?2 WHERE record_id = ?3",
            rusqlite::params![label, &at.to_bytes()[..], record_id.get()],
        )?;
    }

    for record_id in &resolution.mark {
        tx.execute(
            "UPDATE labeled_records SET is_conflict = 0, conflict_resolution = ?1 WHERE record_id = ?2",
            rusqlite::params![resolution.status.as_str(), record_id.get()],
        )?;
    }
    Ok(())
}

fn count_to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

impl ReplicaStore for SqliteReplica {
    fn ping(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn insert_session(&self, session: &SessionRecord, clock: &VectorClock) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO annotator_sessions (session_id, annotator_id, current_replica, is_active, created_at, last_activity, ended_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                session.session_id.as_bytes().as_slice(),
                session.annotator_id,
                session.current_replica.as_str(),
                session.is_active,
                &session.created_at.to_bytes()[..],
                &session.last_activity.to_bytes()[..],
                session.ended_at.map(|h| h.to_bytes().to_vec()),
            ],
        )?;
        merge_session_clock(&tx, session.session_id, clock)?;
        tx.commit()?;
        Ok(())
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StorageError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM annotator_sessions WHERE session_id = ?1"),
                rusqlite::params![session_id.as_bytes().as_slice()],
                SessionRow::read,
            )
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }

    fn list_sessions(&self, active_only: bool) -> Result<Vec<SessionRecord>, StorageError> {
        let conn = self.conn()?;
        let sql = if active_only {
            format!("SELECT {SESSION_COLUMNS} FROM annotator_sessions WHERE is_active = 1 ORDER BY created_at")
        } else {
            format!("SELECT {SESSION_COLUMNS} FROM annotator_sessions ORDER BY created_at")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], SessionRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    fn set_session_replica(
        &self,
        session_id: SessionId,
        replica: &ReplicaId,
        at: Hlc,
    ) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE annotator_sessions SET current_replica = ?1, last_activity = ?2 WHERE session_id = ?3",
            rusqlite::params![
                replica.as_str(),
                &at.to_bytes()[..],
                session_id.as_bytes().as_slice(),
            ],
        )?;
        Ok(changed > 0)
    }

    fn touch_session(&self, session_id: SessionId, at: Hlc) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE annotator_sessions SET last_activity = ?1 WHERE session_id = ?2",
            rusqlite::params![&at.to_bytes()[..], session_id.as_bytes().as_slice()],
        )?;
        Ok(changed > 0)
    }

    fn deactivate_session(&self, session_id: SessionId, at: Hlc) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE annotator_sessions SET is_active = 0, ended_at = COALESCE(ended_at, ?1), last_activity = ?1 WHERE session_id = ?2",
            rusqlite::params![&at.to_bytes()[..], session_id.as_bytes().as_slice()],
        )?;
        Ok(changed > 0)
    }

    fn deactivate_idle_sessions(
        &self,
        idle_before: Hlc,
        at: Hlc,
    ) -> Result<Vec<SessionId>, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT session_id FROM annotator_sessions WHERE is_active = 1 AND last_activity < ?1",
            )?;
            let raw = stmt
                .query_map(rusqlite::params![&idle_before.to_bytes()[..]], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            raw.into_iter()
                .map(|b| Ok(SessionId::from_bytes(to_array::<16>(b, "session_id")?)))
                .collect::<Result<Vec<_>, StorageError>>()?
        };
        tx.execute(
            "UPDATE annotator_sessions SET is_active = 0, ended_at = ?1 WHERE is_active = 1 AND last_activity < ?2",
            rusqlite::params![&at.to_bytes()[..], &idle_before.to_bytes()[..]],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    fn get_session_clock(&self, session_id: SessionId) -> Result<Option<VectorClock>, StorageError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT node_id, counter FROM session_clocks WHERE session_id = ?1")?;
        let rows = stmt
            .query_map(rusqlite::params![session_id.as_bytes().as_slice()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            rows.into_iter()
                .map(|(node, counter)| (node, counter.max(0) as u64))
                .collect(),
        ))
    }

    fn insert_records(&self, records: &[NewRecord], at: Hlc) -> Result<Vec<LabeledRecord>, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = Vec::with_capacity(records.len());

        for record in records {
            let clock_bytes = record.vector_clock.to_msgpack()?;
            tx.execute(
                "INSERT INTO labeled_records (session_id, annotator_id, data_id, original_text, label, confidence, vector_clock, is_conflict, conflict_resolution, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                rusqlite::params![
                    record.session_id.as_bytes().as_slice(),
                    record.annotator_id,
                    record.data_id,
                    record.original_text,
                    record.label,
                    record.confidence.value(),
                    clock_bytes,
                    record.is_conflict,
                    ResolutionStatus::Pending.as_str(),
                    &at.to_bytes()[..],
                ],
            )?;
            let record_id = RecordId::new(tx.last_insert_rowid());

            merge_session_clock(&tx, record.session_id, &record.vector_clock)?;
            tx.execute(
                "UPDATE annotator_sessions SET last_activity = ?1 WHERE session_id = ?2",
                rusqlite::params![&at.to_bytes()[..], record.session_id.as_bytes().as_slice()],
            )?;

            inserted.push(LabeledRecord {
                record_id,
                session_id: record.session_id,
                annotator_id: record.annotator_id.clone(),
                data_id: record.data_id.clone(),
                original_text: record.original_text.clone(),
                label: record.label.clone(),
                confidence: record.confidence,
                vector_clock: record.vector_clock.clone(),
                is_conflict: record.is_conflict,
                conflict_resolution: ResolutionStatus::Pending,
                created_at: at,
                updated_at: at,
            });
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn get_record(&self, record_id: RecordId) -> Result<Option<LabeledRecord>, StorageError> {
        let conn = self.conn()?;
        fetch_record(&conn, record_id)
    }

    fn update_record(
        &self,
        record_id: RecordId,
        update: &RecordUpdate,
        at: Hlc,
    ) -> Result<Option<LabeledRecord>, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let Some(current) = fetch_record(&tx, record_id)? else {
            return Ok(None);
        };

        let clock_bytes = update.vector_clock.as_ref().map(|c| c.to_msgpack()).transpose()?;
        tx.execute(
            "UPDATE labeled_records SET
                label = COALESCE(?1, label),
                confidence = COALESCE(?2, confidence),
                vector_clock = COALESCE(?3, vector_clock),
                is_conflict = is_conflict OR ?4,
                updated_at = ?5
             WHERE record_id = ?6",
            rusqlite::params![
                update.label,
                update.confidence.map(|c| c.value()),
                clock_bytes,
                update.mark_conflict,
                &at.to_bytes()[..],
                record_id.get(),
            ],
        )?;

        if let Some(clock) = &update.vector_clock {
            merge_session_clock(&tx, current.session_id, clock)?;
        }
        tx.execute(
            "UPDATE annotator_sessions SET last_activity = ?1 WHERE session_id = ?2",
            rusqlite::params![&at.to_bytes()[..], current.session_id.as_bytes().as_slice()],
        )?;

        let updated = fetch_record(&tx, record_id)?;
        tx.commit()?;
        Ok(updated)
    }

    fn list_records(
        &self,
        session_id: SessionId,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<LabeledRecord>, StorageError> {
        let conn = self.conn()?;
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(i64::from).unwrap_or(-1);
        query_records(
            &conn,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM labeled_records WHERE session_id = ?1 ORDER BY record_id LIMIT ?2 OFFSET ?3"
            ),
            rusqlite::params![session_id.as_bytes().as_slice(), limit, i64::from(offset)],
        )
    }

    fn list_conflicts(&self, session_id: Option<SessionId>) -> Result<Vec<LabeledRecord>, StorageError> {
        let conn = self.conn()?;
        match session_id {
            Some(sid) => query_records(
                &conn,
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM labeled_records WHERE session_id = ?1 AND is_conflict = 1 ORDER BY record_id"
                ),
                rusqlite::params![sid.as_bytes().as_slice()],
            ),
            None => query_records(
                &conn,
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM labeled_records WHERE is_conflict = 1 ORDER BY record_id"
                ),
                [],
            ),
        }
    }

    fn records_for_data_id(
        &self,
        data_id: &str,
        session_id: Option<SessionId>,
    ) -> Result<Vec<LabeledRecord>, StorageError> {
        let conn = self.conn()?;
        group_records(&conn, data_id, session_id)
    }

    fn resolve_group(
        &self,
        data_id: &str,
        session_id: Option<SessionId>,
        plan: GroupPlanner<'_>,
        archive: bool,
        at: Hlc,
    ) -> Result<Option<GroupResolution>, StorageError> {
        let mut conn = self.conn()?;
        // take the write lock before reading so the plan cannot go stale
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let group = group_records(&tx, data_id, session_id)?;
        let Some(resolution) = plan(&group) else {
            return Ok(None);
        };
        apply_group(&tx, &resolution, archive, at)?;
        tx.commit()?;
        Ok(Some(resolution))
    }

    fn records_by_annotator(&self, annotator_id: &str) -> Result<Vec<LabeledRecord>, StorageError> {
        let conn = self.conn()?;
        query_records(
            &conn,
            &format!("SELECT {RECORD_COLUMNS} FROM labeled_records WHERE annotator_id = ?1 ORDER BY record_id"),
            rusqlite::params![annotator_id],
        )
    }

    fn conflict_counts(&self) -> Result<ConflictCounts, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT session_id, COUNT(*) FROM labeled_records WHERE is_conflict = 1
             GROUP BY session_id ORDER BY session_id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let flagged_by_session = rows
            .into_iter()
            .map(|(sid, count)| {
                Ok((SessionId::from_bytes(to_array::<16>(sid, "session_id")?), count_to_u64(count)))
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        let mut stmt = conn.prepare(
            "SELECT conflict_resolution, COUNT(*) FROM labeled_records
             WHERE is_conflict = 1 OR conflict_resolution != 'pending'
             GROUP BY conflict_resolution ORDER BY conflict_resolution",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let by_resolution = rows
            .into_iter()
            .map(|(status, count)| Ok((ResolutionStatus::parse(&status)?, count_to_u64(count))))
            .collect::<Result<Vec<_>, StorageError>>()?;

        Ok(ConflictCounts {
            flagged: flagged_by_session.iter().map(|(_, n)| n).sum(),
            flagged_by_session,
            by_resolution,
        })
    }

    fn purge_before(&self, cutoff: Hlc) -> Result<PurgeCounts, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let sessions = tx.execute(
            "DELETE FROM annotator_sessions WHERE is_active = 0 AND last_activity < ?1",
            rusqlite::params![&cutoff.to_bytes()[..]],
        )?;
        let records = tx.execute(
            "DELETE FROM labeled_records WHERE is_conflict = 0 AND created_at < ?1",
            rusqlite::params![&cutoff.to_bytes()[..]],
        )?;
        tx.commit()?;
        Ok(PurgeCounts {
            sessions: sessions as u64,
            records: records as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(annotator: &str, at: Hlc) -> SessionRecord {
        SessionRecord {
            session_id: SessionId::new(),
            annotator_id: annotator.into(),
            current_replica: ReplicaId::from("primary"),
            is_active: true,
            created_at: at,
            last_activity: at,
            ended_at: None,
        }
    }

    fn new_record(session_id: SessionId, data_id: &str, label: &str, clock: VectorClock) -> NewRecord {
        NewRecord {
            session_id,
            annotator_id: "ann-1".into(),
            data_id: data_id.into(),
            original_text: format!("text for {data_id}"),
            label: label.into(),
            confidence: Confidence::new(0.8).unwrap(),
            vector_clock: clock,
            is_conflict: false,
        }
    }

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|(n, c)| (*n, *c)).collect()
    }

    #[test]
    fn session_roundtrip_and_clock() {
        let store = SqliteReplica::open_in_memory().unwrap();
        let s = session("ann-1", Hlc::new(1_000, 0));
        store.insert_session(&s, &VectorClock::create("primary")).unwrap();

        assert_eq!(store.get_session(s.session_id).unwrap(), Some(s.clone()));
        assert_eq!(
            store.get_session_clock(s.session_id).unwrap(),
            Some(VectorClock::create("primary"))
        );
        assert!(store.get_session(SessionId::new()).unwrap().is_none());
        assert!(store.get_session_clock(SessionId::new()).unwrap().is_none());
    }

    #[test]
    fn insert_records_merges_session_clock_with_max() {
        let store = SqliteReplica::open_in_memory().unwrap();
        let s = session("ann-1", Hlc::new(1_000, 0));
        store.insert_session(&s, &VectorClock::create("primary")).unwrap();

        let records = vec![
            new_record(s.session_id, "d1", "positive", clock(&[("primary", 3), ("tab", 1)])),
            new_record(s.session_id, "d2", "negative", clock(&[("primary", 1), ("tab", 4)])),
        ];
        let inserted = store.insert_records(&records, Hlc::new(2_000, 0)).unwrap();
        assert_eq!(inserted.len(), 2);
        assert!(inserted[0].record_id < inserted[1].record_id);

        let merged = store.get_session_clock(s.session_id).unwrap().unwrap();
        assert_eq!(merged, clock(&[("primary", 3), ("tab", 4)]));

        let touched = store.get_session(s.session_id).unwrap().unwrap();
        assert_eq!(touched.last_activity, Hlc::new(2_000, 0));
    }

    #[test]
    fn failed_batch_leaves_nothing_behind() {
        let store = SqliteReplica::open_in_memory().unwrap();
        let s = session("ann-1", Hlc::new(1_000, 0));
        store.insert_session(&s, &VectorClock::new()).unwrap();

        // second record references a session that does not exist, so the
        // clock merge violates the foreign key and the whole batch rolls back
        let records = vec![
            new_record(s.session_id, "d1", "positive", clock(&[("primary", 1)])),
            new_record(SessionId::new(), "d2", "negative", clock(&[("primary", 2)])),
        ];
        assert!(store.insert_records(&records, Hlc::new(2_000, 0)).is_err());
        assert!(store.list_records(s.session_id, None, 0).unwrap().is_empty());
        assert!(store.get_session_clock(s.session_id).unwrap().is_none());
    }

    #[test]
    fn update_is_partial_and_never_clears_conflict() {
        let store = SqliteReplica::open_in_memory().unwrap();
        let s = session("ann-1", Hlc::new(1_000, 0));
        store.insert_session(&s, &VectorClock::new()).unwrap();
        let mut rec = new_record(s.session_id, "d1", "positive", clock(&[("primary", 1)]));
        rec.is_conflict = true;
        let inserted = store.insert_records(&[rec], Hlc::new(2_000, 0)).unwrap().remove(0);

        let update = RecordUpdate {
            confidence: Some(Confidence::new(0.3).unwrap()),
            ..Default::default()
        };
        let updated = store
            .update_record(inserted.record_id, &update, Hlc::new(3_000, 0))
            .unwrap()
            .unwrap();
        assert_eq!(updated.label, "positive");
        assert_eq!(updated.confidence.value(), 0.3);
        assert!(updated.is_conflict);
        assert_eq!(updated.updated_at, Hlc::new(3_000, 0));
        assert_eq!(updated.created_at, Hlc::new(2_000, 0));

        assert!(store
            .update_record(RecordId::new(999), &update, Hlc::new(4_000, 0))
            .unwrap()
            .is_none());
    }

    #[test]
    fn resolution_deletes_marks_and_archives_in_one_go() {
        let store = SqliteReplica::open_in_memory().unwrap();
        let s = session("ann-1", Hlc::new(1_000, 0));
        store.insert_session(&s, &VectorClock::new()).unwrap();
        let mut a = new_record(s.session_id, "d1", "positive", clock(&[("n1", 1)]));
        let mut b = new_record(s.session_id, "d1", "negative", clock(&[("n2", 1)]));
        a.is_conflict = true;
        b.is_conflict = true;
        let ids: Vec<RecordId> = store
            .insert_records(&[a, b], Hlc::new(2_000, 0))
            .unwrap()
            .into_iter()
            .map(|r| r.record_id)
            .collect();

        let survivor = ids[1];
        let planner = |group: &[LabeledRecord]| {
            if !group.iter().any(|r| r.is_conflict) {
                return None;
            }
            Some(GroupResolution {
                data_id: "d1".into(),
                status: ResolutionStatus::LastWriteWins,
                survivor: Some(survivor),
                delete: group.iter().map(|r| r.record_id).filter(|id| *id != survivor).collect(),
                mark: vec![survivor],
                relabel: None,
            })
        };
        let applied = store
            .resolve_group("d1", Some(s.session_id), &planner, true, Hlc::new(3_000, 0))
            .unwrap()
            .unwrap();
        assert_eq!(applied.delete, vec![ids[0]]);
        // the planner sees the settled group the second time round
        assert!(store
            .resolve_group("d1", Some(s.session_id), &planner, true, Hlc::new(4_000, 0))
            .unwrap()
            .is_none());

        let left = store.records_for_data_id("d1", Some(s.session_id)).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].record_id, ids[1]);
        assert!(!left[0].is_conflict);
        assert_eq!(left[0].conflict_resolution, ResolutionStatus::LastWriteWins);
        assert!(store.list_conflicts(Some(s.session_id)).unwrap().is_empty());

        let conn = store.conn().unwrap();
        let archived: i64 = conn
            .query_row("SELECT COUNT(*) FROM resolved_archive WHERE survivor_id = ?1", [ids[1].get()], |r| r.get(0))
            .unwrap();
        assert_eq!(archived, 1);
    }

    #[test]
    fn annotator_records_and_conflict_counts() {
        let store = SqliteReplica::open_in_memory().unwrap();
        let s1 = session("ann-1", Hlc::new(1_000, 0));
        let s2 = session("ann-2", Hlc::new(1_000, 0));
        store.insert_session(&s1, &VectorClock::new()).unwrap();
        store.insert_session(&s2, &VectorClock::new()).unwrap();

        let mut flagged = new_record(s1.session_id, "d1", "negative", clock(&[("n2", 1)]));
        flagged.is_conflict = true;
        let mut other = new_record(s2.session_id, "d2", "positive", clock(&[("n3", 1)]));
        other.annotator_id = "ann-2".into();
        other.is_conflict = true;
        let written = store
            .insert_records(
                &[new_record(s1.session_id, "d1", "positive", clock(&[("n1", 1)])), flagged, other],
                Hlc::new(2_000, 0),
            )
            .unwrap();

        let mine = store.records_by_annotator("ann-1").unwrap();
        assert_eq!(mine.len(), 2);
        assert!(store.records_by_annotator("nobody").unwrap().is_empty());

        let counts = store.conflict_counts().unwrap();
        assert_eq!(counts.flagged, 2);
        assert_eq!(counts.flagged_by_session.len(), 2);
        assert_eq!(counts.by_resolution, vec![(ResolutionStatus::Pending, 2)]);

        // settle the second session's conflict by hand
        let settled = written[2].record_id;
        store
            .resolve_group(
                "d2",
                None,
                &|_: &[LabeledRecord]| {
                    Some(GroupResolution {
                        data_id: "d2".into(),
                        status: ResolutionStatus::Manual,
                        survivor: None,
                        delete: Vec::new(),
                        mark: vec![settled],
                        relabel: None,
                    })
                },
                false,
                Hlc::new(3_000, 0),
            )
            .unwrap();
        let counts = store.conflict_counts().unwrap();
        assert_eq!(counts.flagged, 1);
        assert_eq!(counts.flagged_by_session, vec![(s1.session_id, 1)]);
        assert_eq!(
            counts.by_resolution,
            vec![(ResolutionStatus::Manual, 1), (ResolutionStatus::Pending, 1)]
        );
    }

    #[test]
    fn idle_sessions_are_deactivated_then_purged() {
        let store = SqliteReplica::open_in_memory().unwrap();
        let old = session("ann-old", Hlc::new(1_000, 0));
        let fresh = session("ann-new", Hlc::new(9_000, 0));
        store.insert_session(&old, &VectorClock::create("primary")).unwrap();
        store.insert_session(&fresh, &VectorClock::create("primary")).unwrap();

        let expired = store
            .deactivate_idle_sessions(Hlc::new(5_000, 0), Hlc::new(10_000, 0))
            .unwrap();
        assert_eq!(expired, vec![old.session_id]);
        assert_eq!(store.list_sessions(true).unwrap().len(), 1);

        // last_activity of the expired session is still 1_000
        let counts = store.purge_before(Hlc::new(5_000, 0)).unwrap();
        assert_eq!(counts.sessions, 1);
        assert!(store.get_session(old.session_id).unwrap().is_none());
        assert!(store.get_session_clock(old.session_id).unwrap().is_none());
    }

    #[test]
    fn secondary_reads_what_primary_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.db");
        let primary = SqliteReplica::open_primary(&path, Duration::from_secs(1)).unwrap();
        let secondary = SqliteReplica::open_secondary(&path, Duration::from_secs(1)).unwrap();

        let s = session("ann-1", Hlc::new(1_000, 0));
        primary.insert_session(&s, &VectorClock::create("primary")).unwrap();
        primary
            .insert_records(
                &[new_record(s.session_id, "d1", "positive", clock(&[("primary", 1)]))],
                Hlc::new(2_000, 0),
            )
            .unwrap();

        secondary.ping().unwrap();
        assert_eq!(secondary.list_records(s.session_id, Some(10), 0).unwrap().len(), 1);
        assert!(secondary.touch_session(s.session_id, Hlc::new(3_000, 0)).is_err());
    }
}
