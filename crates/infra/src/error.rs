//! Error types for the persistence and application layers.

use thiserror::Error;

use haggle_core::DomainError;
use haggle_negotiation::InvariantViolation;

/// Repository operation error.
///
/// These are storage-level failures. `Conflict` is the optimistic concurrency
/// signal; everything else except `NotFound` is an infrastructure failure.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("negotiation not found")]
    NotFound,

    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    /// A stored record failed validation on the way back in.
    #[error("stored negotiation is corrupted: {0}")]
    Corrupted(String),
}

impl From<InvariantViolation> for RepositoryError {
    fn from(value: InvariantViolation) -> Self {
        RepositoryError::Corrupted(value.message().to_string())
    }
}

/// Error surfaced by every negotiation service operation.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("negotiation not found")]
    NotFound,

    /// The record changed since it was loaded. Never retried automatically.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl ServiceError {
    /// Errors the reaper treats as a lost race on a single record.
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            ServiceError::InvalidState(_) | ServiceError::NotFound | ServiceError::Conflict(_)
        )
    }
}

impl From<DomainError> for ServiceError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidArgument(msg) => ServiceError::InvalidArgument(msg),
            DomainError::InvalidState(msg) => ServiceError::InvalidState(msg),
            DomainError::NotFound => ServiceError::NotFound,
            DomainError::Conflict(msg) => ServiceError::Conflict(msg),
        }
    }
}

impl From<RepositoryError> for ServiceError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound => ServiceError::NotFound,
            RepositoryError::Conflict(msg) => ServiceError::Conflict(msg),
            RepositoryError::Backend(msg) => ServiceError::Infrastructure(msg),
            RepositoryError::Corrupted(msg) => {
                ServiceError::Infrastructure(format!("corrupted record: {msg}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_errors_map_onto_service_taxonomy() {
        assert!(matches!(
            ServiceError::from(RepositoryError::NotFound),
            ServiceError::NotFound
        ));
        assert!(matches!(
            ServiceError::from(RepositoryError::Conflict("stale".into())),
            ServiceError::Conflict(_)
        ));
        assert!(matches!(
            ServiceError::from(RepositoryError::Backend("down".into())),
            ServiceError::Infrastructure(_)
        ));
        assert!(matches!(
            ServiceError::from(RepositoryError::from(InvariantViolation::new("gap"))),
            ServiceError::Infrastructure(_)
        ));
    }

    #[test]
    fn only_record_level_races_are_benign() {
        assert!(ServiceError::Conflict("x".into()).is_benign_race());
        assert!(ServiceError::NotFound.is_benign_race());
        assert!(ServiceError::InvalidState("x".into()).is_benign_race());
        assert!(!ServiceError::Infrastructure("x".into()).is_benign_race());
        assert!(!ServiceError::InvalidArgument("x".into()).is_benign_race());
    }
}
