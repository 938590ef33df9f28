//! Errors raised by external adapters and the post-commit machinery.

use tiae_core::error::TiaeError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// Worth retrying: network trouble, 5xx, throttling.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("call timed out")]
    Timeout,

    /// Compare-and-set lost against a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The remote side refused the request; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("adapter misconfigured: {0}")]
    Config(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Transient(_) | AdapterError::Timeout | AdapterError::Conflict(_)
        )
    }
}

impl From<TiaeError> for AdapterError {
    fn from(err: TiaeError) -> Self {
        if err.is_transient() {
            AdapterError::Transient(err.to_string())
        } else {
            AdapterError::Rejected(err.to_string())
        }
    }
}

impl From<AdapterError> for TiaeError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Transient(_) | AdapterError::Timeout => {
                TiaeError::Transient(err.to_string())
            }
            AdapterError::Conflict(msg) => TiaeError::Conflict(msg),
            AdapterError::NotFound(what) => TiaeError::NotFound {
                entity: "external object".into(),
                id: what,
            },
            AdapterError::Rejected(_) | AdapterError::Config(_) => {
                TiaeError::Internal(err.to_string())
            }
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return AdapterError::Timeout;
        }
        if err.is_connect() || err.is_request() {
            return AdapterError::Transient(err.to_string());
        }
        match err.status() {
            Some(s) if s.as_u16() == 409 => AdapterError::Conflict(err.to_string()),
            Some(s) if s.as_u16() == 404 => AdapterError::NotFound(err.to_string()),
            Some(s) if s.as_u16() == 429 || s.is_server_error() => {
                AdapterError::Transient(err.to_string())
            }
            _ => AdapterError::Rejected(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiae_core::error::ErrorKind;

    #[test]
    fn conflicts_and_timeouts_are_retryable() {
        assert!(AdapterError::Timeout.is_transient());
        assert!(AdapterError::Conflict("resourceVersion".into()).is_transient());
        assert!(!AdapterError::Rejected("403".into()).is_transient());
    }

    #[test]
    fn transient_state_errors_stay_transient() {
        let err: AdapterError = TiaeError::Transient("pool timed out".into()).into();
        assert!(err.is_transient());
        let err: AdapterError = TiaeError::Internal("boom".into()).into();
        assert!(!err.is_transient());
        assert_eq!(TiaeError::from(AdapterError::Timeout).kind(), ErrorKind::Transient);
    }
}
