//! Error taxonomy shared by every persona crate.

use std::time::Duration;

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    /// A backend did not answer within `provider_timeout`.
    #[error("provider '{provider}' timed out after {after:?}")]
    ProviderTimeout { provider: String, after: Duration },

    /// A backend was skipped because its circuit is open.
    #[error("provider '{provider}' unavailable (circuit open)")]
    ProviderUnavailable { provider: String },

    /// The memory medium could not be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Malformed or duplicate memory entries were detected.
    #[error("memory corruption in persona '{persona_id}': {detail}")]
    MemoryCorruption { persona_id: String, detail: String },

    /// Configuration failed to parse or validate.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Caller input was rejected (e.g. an empty message).
    #[error("{0}")]
    Validation(String),
}

impl CoreError {
    /// Errors the cascade absorbs by moving on to the next backend.
    pub fn is_recoverable_by_failover(&self) -> bool {
        matches!(
            self,
            Self::ProviderTimeout { .. } | Self::ProviderUnavailable { .. }
        )
    }

    /// Errors that callers should surface to the end user.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
