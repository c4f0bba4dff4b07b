use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("confidence out of range: {0} (expected 0.0..=1.0)")]
    ConfidenceOutOfRange(f64),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
