use thiserror::Error;

/// Failures of the underlying storage medium.
///
/// None of these are fatal: callers degrade to the in-memory value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage is not available in this execution context")]
    Unavailable,
    #[error("storage quota exceeded while writing `{key}`")]
    QuotaExceeded { key: String },
    #[error("storage I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode value: {0}")]
    Encode(String),
    #[error("failed to decode stored text: {0}")]
    Decode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EstimateError {
    #[error("illegal estimate label `{0}`")]
    IllegalLabel(String),
}

/// Errors raised by the replicated estimation state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedStateError {
    #[error(transparent)]
    Estimate(#[from] EstimateError),
    #[error("empty participant id")]
    EmptyParticipant,
    #[error("replication update rejected: {0}")]
    Replication(String),
}
