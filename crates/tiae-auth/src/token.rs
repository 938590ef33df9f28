//! Signed envelope tokens for email links, and opaque session/refresh
//! tokens.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tiae_core::models::url_token::UrlTokenPurpose;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::AuthError;

/// Why an envelope token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("envelope signature does not verify")]
    BadSignature,

    #[error("envelope has expired")]
    Expired,

    #[error("envelope is malformed")]
    Malformed,
}

/// Claims embedded in an envelope token.
///
/// The envelope only points at a URL token row; it is honoured only while
/// that row is unconsumed and unexpired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvelopeClaims {
    /// Tenant id. The nil UUID marks admin tokens in the global catalog.
    pub tid: Uuid,
    /// URL token id.
    pub uid: Uuid,
    pub purpose: UrlTokenPurpose,
    pub iat: i64,
    pub exp: i64,
}

impl EnvelopeClaims {
    pub fn is_admin(&self) -> bool {
        self.tid.is_nil()
    }
}

/// Sign an envelope for `url_token_id` expiring at `expires_at`.
pub fn issue_envelope(
    tenant_id: Uuid,
    url_token_id: Uuid,
    purpose: UrlTokenPurpose,
    expires_at: DateTime<Utc>,
    config: &AuthConfig,
) -> Result<String, AuthError> {
    let claims = EnvelopeClaims {
        tid: tenant_id,
        uid: url_token_id,
        purpose,
        iat: Utc::now().timestamp(),
        exp: expires_at.timestamp(),
    };
    let key = EncodingKey::from_secret(config.signing_secret.as_bytes());
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
        .map_err(|e| AuthError::Crypto(format!("envelope encode: {e}")))
}

/// Verify signature and expiry and return the claims.
pub fn verify_envelope(token: &str, config: &AuthConfig) -> Result<EnvelopeClaims, EnvelopeError> {
    use jsonwebtoken::errors::ErrorKind;

    let key = DecodingKey::from_secret(config.signing_secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.set_required_spec_claims(&["exp"]);

    jsonwebtoken::decode::<EnvelopeClaims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => EnvelopeError::Expired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                EnvelopeError::BadSignature
            }
            _ => EnvelopeError::Malformed,
        })
}

/// A fresh session id: 128 random bits, no embedded claims.
pub fn generate_session_token() -> Uuid {
    Uuid::new_v4()
}

/// Parse a bearer session token from request metadata.
pub fn parse_session_token(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

/// Generate a cryptographically random opaque refresh token
/// (32 bytes → base64url-encoded, no padding).
pub fn generate_refresh_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rand::Rng::random(&mut rng);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hash of a raw refresh token, hex-encoded. Only this form is
/// persisted.
pub fn hash_refresh_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_config() -> AuthConfig {
        AuthConfig {
            signing_secret: "test-signing-secret-0123456789".into(),
            ..AuthConfig::default()
        }
    }

    #[test]
    fn envelope_roundtrip() {
        let config = test_config();
        let tenant = Uuid::new_v4();
        let url_token = Uuid::new_v4();
        let token = issue_envelope(
            tenant,
            url_token,
            UrlTokenPurpose::Signup,
            Utc::now() + Duration::hours(1),
            &config,
        )
        .unwrap();

        let claims = verify_envelope(&token, &config).unwrap();
        assert_eq!(claims.tid, tenant);
        assert_eq!(claims.uid, url_token);
        assert_eq!(claims.purpose, UrlTokenPurpose::Signup);
        assert!(!claims.is_admin());
    }

    #[test]
    fn envelope_is_url_safe() {
        let config = test_config();
        let token = issue_envelope(
            Uuid::nil(),
            Uuid::new_v4(),
            UrlTokenPurpose::Reset,
            Utc::now() + Duration::hours(1),
            &config,
        )
        .unwrap();
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        );
    }

    #[test]
    fn expired_envelope_is_rejected() {
        let config = test_config();
        let token = issue_envelope(
            Uuid::new_v4(),
            Uuid::new_v4(),
            UrlTokenPurpose::Forgot,
            Utc::now() - Duration::seconds(5),
            &config,
        )
        .unwrap();
        assert_eq!(verify_envelope(&token, &config), Err(EnvelopeError::Expired));
    }

    #[test]
    fn wrong_secret_is_bad_signature() {
        let config = test_config();
        let token = issue_envelope(
            Uuid::new_v4(),
            Uuid::new_v4(),
            UrlTokenPurpose::Signup,
            Utc::now() + Duration::hours(1),
            &config,
        )
        .unwrap();
        let other = AuthConfig {
            signing_secret: "another-secret-entirely-42".into(),
            ..AuthConfig::default()
        };
        assert_eq!(
            verify_envelope(&token, &other),
            Err(EnvelopeError::BadSignature)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let config = test_config();
        assert_eq!(
            verify_envelope("not.a.token", &config),
            Err(EnvelopeError::Malformed)
        );
        assert_eq!(verify_envelope("", &config), Err(EnvelopeError::Malformed));
    }

    #[test]
    fn session_tokens_parse_back() {
        let token = generate_session_token();
        assert_eq!(parse_session_token(&token.to_string()), Some(token));
        assert_eq!(parse_session_token("nope"), None);
    }

    #[test]
    fn refresh_token_is_url_safe() {
        let token = generate_refresh_token();
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        // 32 bytes → 43 base64url chars.
        assert_eq!(token.len(), 43);
    }

    #[test]
    fn refresh_token_hash_is_deterministic() {
        let raw = "some-refresh-token";
        assert_eq!(hash_refresh_token(raw), hash_refresh_token(raw));
        assert_eq!(hash_refresh_token(raw).len(), 64);
        assert_ne!(hash_refresh_token(raw), hash_refresh_token("other"));
    }
}
