use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("replica unavailable: {0}")]
    Unavailable(String),

    #[error("replica timed out: {0}")]
    Timeout(String),

    #[error("core error: {0}")]
    Core(#[from] labelsync_core::CoreError),
}

impl StorageError {
    /// Failures worth retrying against another replica: the store could not
    /// be reached or did not answer in time. Constraint violations, bad rows
    /// and serialization problems are not transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}
