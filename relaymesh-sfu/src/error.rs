use thiserror::Error;

use crate::engine::EngineError;
use crate::registry::RegistryError;

/// Errors surfaced by SFU operations.
///
/// Everything except [`SfuError::Fatal`] is recovered at the request boundary
/// and reported to the peer; `Fatal` means the engine state behind a room can
/// no longer be trusted.
#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Incompatible: {0}")]
    Incompatible(String),

    #[error("Engine failure: {0}")]
    EngineFailure(#[from] EngineError),

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl SfuError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn conflict(what: impl std::fmt::Display) -> Self {
        Self::Conflict(what.to_string())
    }

    /// Stable code used on the wire
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Incompatible(_) => "incompatible",
            Self::EngineFailure(_) => "engine_failure",
            Self::Fatal(_) => "fatal",
        }
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<RegistryError> for SfuError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(msg) => Self::NotFound(msg),
            RegistryError::Conflict(msg) => Self::Conflict(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SfuError::not_found("transport t1").code(), "not_found");
        assert_eq!(SfuError::conflict("already connected").code(), "conflict");
        assert_eq!(SfuError::Incompatible("x".into()).code(), "incompatible");
        assert_eq!(
            SfuError::from(EngineError::Rejected("boom".into())).code(),
            "engine_failure"
        );
        assert!(SfuError::Fatal("worker died".into()).is_fatal());
    }

    #[test]
    fn test_registry_error_mapping() {
        let err: SfuError = RegistryError::Conflict("duplicate peer".into()).into();
        assert!(matches!(err, SfuError::Conflict(msg) if msg == "duplicate peer"));
    }
}
