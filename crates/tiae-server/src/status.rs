//! Mapping from control-plane errors to RPC status codes.

use tiae_core::error::{ErrorKind, TiaeError};
use tonic::{Code, Status};
use tracing::error;

pub fn code_for(kind: ErrorKind) -> Code {
    match kind {
        ErrorKind::InvalidArgument => Code::InvalidArgument,
        ErrorKind::NotFound => Code::NotFound,
        ErrorKind::AlreadyExists => Code::AlreadyExists,
        ErrorKind::Unauthenticated | ErrorKind::InvalidToken | ErrorKind::Expired => {
            Code::Unauthenticated
        }
        ErrorKind::PermissionDenied => Code::PermissionDenied,
        ErrorKind::AlreadyConsumed | ErrorKind::Conflict => Code::FailedPrecondition,
        ErrorKind::Transient => Code::Unavailable,
        ErrorKind::Internal | ErrorKind::Fatal => Code::Internal,
    }
}

/// Internal failures are logged here and reach the client without detail.
pub fn to_status(err: &TiaeError) -> Status {
    let code = code_for(err.kind());
    match err {
        TiaeError::Fatal { incident_id, .. } => {
            Status::new(code, format!("internal error (incident {incident_id})"))
        }
        TiaeError::Internal(_) | TiaeError::ProvisioningFailed(_) => {
            error!(error = %err, "Request failed");
            Status::new(code, "internal error")
        }
        other => Status::new(code, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn token_failures_are_unauthenticated() {
        assert_eq!(to_status(&TiaeError::Expired).code(), Code::Unauthenticated);
        assert_eq!(
            to_status(&TiaeError::InvalidToken("forged".into())).code(),
            Code::Unauthenticated
        );
        assert_eq!(
            to_status(&TiaeError::AlreadyConsumed).code(),
            Code::FailedPrecondition
        );
    }

    #[test]
    fn internal_details_are_hidden() {
        let status = to_status(&TiaeError::Internal("password column missing".into()));
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "internal error");

        let incident_id = Uuid::new_v4();
        let status = to_status(&TiaeError::Fatal {
            incident_id,
            message: "split".into(),
        });
        assert!(status.message().contains(&incident_id.to_string()));
    }

    #[test]
    fn transient_maps_to_unavailable() {
        assert_eq!(
            to_status(&TiaeError::Transient("pool".into())).code(),
            Code::Unavailable
        );
        assert_eq!(
            to_status(&TiaeError::already_exists("tenant")).code(),
            Code::AlreadyExists
        );
    }
}
