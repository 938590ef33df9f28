//! Authentication error types.

use thiserror::Error;
use tiae_core::error::TiaeError;

use crate::token::EnvelopeError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("wrong tenant, email and/or password")]
    InvalidCredentials,

    #[error("account is disabled")]
    AccountDisabled,

    #[error("password does not meet policy: {0}")]
    WeakPassword(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("cryptography error: {0}")]
    Crypto(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<AuthError> for TiaeError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials | AuthError::AccountDisabled => {
                TiaeError::Unauthenticated(err.to_string())
            }
            AuthError::WeakPassword(msg) => TiaeError::InvalidArgument(msg),
            AuthError::Envelope(EnvelopeError::Expired) => TiaeError::Expired,
            AuthError::Envelope(e) => TiaeError::InvalidToken(e.to_string()),
            AuthError::Crypto(msg) | AuthError::Config(msg) => TiaeError::Internal(msg),
        }
    }
}
