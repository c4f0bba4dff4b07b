use labelsync_core::{CoreError, RecordId, ReplicaId, SessionId};
use labelsync_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("replica unavailable: {0}")]
    ReplicaUnavailable(ReplicaId),

    #[error("unknown resolution strategy: {0}")]
    UnknownStrategy(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_) | Self::RecordNotFound(_))
    }

    /// A replica could not be reached or timed out. Reads recover from this
    /// by moving to another replica; writes surface it.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_transient(),
            _ => false,
        }
    }
}
