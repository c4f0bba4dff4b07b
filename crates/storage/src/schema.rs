use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS annotator_sessions (
    session_id BLOB PRIMARY KEY CHECK (length(session_id) = 16),
    annotator_id TEXT NOT NULL,
    current_replica TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at BLOB NOT NULL CHECK (length(created_at) = 12),
    last_activity BLOB NOT NULL CHECK (length(last_activity) = 12),
    ended_at BLOB CHECK (ended_at IS NULL OR length(ended_at) = 12)
);
CREATE INDEX IF NOT EXISTS idx_sessions_active ON annotator_sessions (is_active, last_activity);

CREATE TABLE IF NOT EXISTS session_clocks (
    session_id BLOB NOT NULL REFERENCES annotator_sessions (session_id) ON DELETE CASCADE,
    node_id TEXT NOT NULL,
    counter INTEGER NOT NULL CHECK (counter >= 0),
    PRIMARY KEY (session_id, node_id)
);

CREATE TABLE IF NOT EXISTS labeled_records (
    record_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id BLOB NOT NULL CHECK (length(session_id) = 16),
    annotator_id TEXT NOT NULL,
    data_id TEXT NOT NULL,
    original_text TEXT NOT NULL,
    label TEXT NOT NULL,
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    vector_clock BLOB NOT NULL,
    is_conflict INTEGER NOT NULL DEFAULT 0,
    conflict_resolution TEXT NOT NULL DEFAULT 'pending',
    created_at BLOB NOT NULL CHECK (length(created_at) = 12),
    updated_at BLOB NOT NULL CHECK (length(updated_at) = 12)
);
CREATE INDEX IF NOT EXISTS idx_records_session ON labeled_records (session_id, record_id);
CREATE INDEX IF NOT EXISTS idx_records_data ON labeled_records (data_id, session_id);
CREATE INDEX IF NOT EXISTS idx_records_conflict ON labeled_records (session_id) WHERE is_conflict = 1;
CREATE INDEX IF NOT EXISTS idx_records_annotator ON labeled_records (annotator_id, updated_at);

CREATE TABLE IF NOT EXISTS resolved_archive (
    record_id INTEGER PRIMARY KEY,
    session_id BLOB NOT NULL,
    annotator_id TEXT NOT NULL,
    data_id TEXT NOT NULL,
    original_text TEXT NOT NULL,
    label TEXT NOT NULL,
    confidence REAL NOT NULL,
    vector_clock BLOB NOT NULL,
    created_at BLOB NOT NULL,
    updated_at BLOB NOT NULL,
    resolved_at BLOB NOT NULL CHECK (length(resolved_at) = 12),
    resolution TEXT NOT NULL,
    survivor_id INTEGER
);
";
