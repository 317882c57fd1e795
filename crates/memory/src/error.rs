use thiserror::Error;

use persona_core::CoreError;

#[derive(Error, Debug)]
pub enum MemoryError {
    /// The backing medium cannot be reached.  Callers degrade to an empty
    /// payload instead of failing the request.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The persona document is not a JSON object at all.
    #[error("memory document for '{persona_id}' is corrupt: {detail}")]
    Corrupt { persona_id: String, detail: String },

    #[error("memory entry not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

impl From<MemoryError> for CoreError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::StorageUnavailable(detail) => CoreError::StorageUnavailable(detail),
            MemoryError::Io(err) => CoreError::StorageUnavailable(err.to_string()),
            MemoryError::Corrupt { persona_id, detail } => {
                CoreError::MemoryCorruption { persona_id, detail }
            }
            MemoryError::Serialization(err) => CoreError::MemoryCorruption {
                persona_id: String::new(),
                detail: err.to_string(),
            },
            MemoryError::NotFound(id) => CoreError::Validation(format!("memory entry not found: {id}")),
        }
    }
}
