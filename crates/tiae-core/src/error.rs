//! Error types for the tenant control plane.

use thiserror::Error;
use uuid::Uuid;

/// Coarse classification of every error the control plane can return.
///
/// The RPC boundary maps these to status codes; retry loops only look at
/// [`ErrorKind::Transient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Unauthenticated,
    PermissionDenied,
    InvalidToken,
    Expired,
    AlreadyConsumed,
    Conflict,
    Internal,
    Transient,
    Fatal,
}

#[derive(Debug, Error)]
pub enum TiaeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid tenant short name: {0}")]
    InvalidShortName(String),

    #[error("entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("entity already exists: {entity}")]
    AlreadyExists { entity: String },

    #[error("{0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token has expired")]
    Expired,

    #[error("token has already been used")]
    AlreadyConsumed,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("tenant provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("reconciliation needed (incident {incident_id}): {message}")]
    Fatal { incident_id: Uuid, message: String },
}

impl TiaeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TiaeError::InvalidArgument(_) | TiaeError::InvalidShortName(_) => {
                ErrorKind::InvalidArgument
            }
            TiaeError::NotFound { .. } => ErrorKind::NotFound,
            TiaeError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            TiaeError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            TiaeError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            TiaeError::InvalidToken(_) => ErrorKind::InvalidToken,
            TiaeError::Expired => ErrorKind::Expired,
            TiaeError::AlreadyConsumed => ErrorKind::AlreadyConsumed,
            TiaeError::Conflict(_) => ErrorKind::Conflict,
            TiaeError::ProvisioningFailed(_) | TiaeError::Internal(_) => ErrorKind::Internal,
            TiaeError::Transient(_) => ErrorKind::Transient,
            TiaeError::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether the failed operation may be retried as-is.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        TiaeError::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn already_exists(entity: &str) -> Self {
        TiaeError::AlreadyExists {
            entity: entity.into(),
        }
    }
}

pub type TiaeResult<T> = Result<T, TiaeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_errors_are_invalid_arguments() {
        let err = TiaeError::InvalidShortName("ACME".into());
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!err.is_transient());
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(TiaeError::Transient("pool timed out".into()).is_transient());
        assert!(!TiaeError::Conflict("stale".into()).is_transient());
        assert!(
            !TiaeError::Fatal {
                incident_id: Uuid::new_v4(),
                message: "split commit".into()
            }
            .is_transient()
        );
    }
}
