//! Authentication configuration.

use std::env;

use crate::error::AuthError;
use crate::password::MIN_BCRYPT_COST;

/// Configuration for credential and token handling.
#[derive(Clone)]
pub struct AuthConfig {
    /// HMAC secret used to sign envelope tokens.
    pub signing_secret: String,
    /// Session lifetime in seconds (default: 2_700 = 45 minutes).
    pub session_lifetime_secs: u64,
    /// Refresh lifetime in seconds (default: 86_400 = 24 hours).
    pub refresh_lifetime_secs: u64,
    /// URL token lifetime in seconds (default: 259_200 = 72 hours).
    pub url_token_lifetime_secs: u64,
    /// bcrypt work factor. Values below 10 are raised to 10.
    pub bcrypt_cost: u32,
    /// Minimum password length for policy enforcement.
    pub min_password_length: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            session_lifetime_secs: 2_700,
            refresh_lifetime_secs: 86_400,
            url_token_lifetime_secs: 259_200,
            bcrypt_cost: MIN_BCRYPT_COST,
            min_password_length: 6,
        }
    }
}

impl AuthConfig {
    /// Read `TOKEN_SIGNING_SECRET` and optional `BCRYPT_COST`,
    /// `SESSION_TTL_SECS`, `REFRESH_TTL_SECS`, `URL_TOKEN_TTL_SECS`.
    pub fn from_env() -> Result<Self, AuthError> {
        let signing_secret = env::var("TOKEN_SIGNING_SECRET")
            .map_err(|_| AuthError::Config("TOKEN_SIGNING_SECRET is not set".into()))?;
        if signing_secret.len() < 16 {
            return Err(AuthError::Config(
                "TOKEN_SIGNING_SECRET must be at least 16 bytes".into(),
            ));
        }

        let defaults = Self::default();
        Ok(Self {
            signing_secret,
            session_lifetime_secs: env_u64("SESSION_TTL_SECS", defaults.session_lifetime_secs)?,
            refresh_lifetime_secs: env_u64("REFRESH_TTL_SECS", defaults.refresh_lifetime_secs)?,
            url_token_lifetime_secs: env_u64(
                "URL_TOKEN_TTL_SECS",
                defaults.url_token_lifetime_secs,
            )?,
            bcrypt_cost: (env_u64("BCRYPT_COST", defaults.bcrypt_cost.into())? as u32)
                .max(MIN_BCRYPT_COST),
            min_password_length: defaults.min_password_length,
        })
    }

    pub fn effective_bcrypt_cost(&self) -> u32 {
        self.bcrypt_cost.max(MIN_BCRYPT_COST)
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("signing_secret", &"<redacted>")
            .field("session_lifetime_secs", &self.session_lifetime_secs)
            .field("refresh_lifetime_secs", &self.refresh_lifetime_secs)
            .field("url_token_lifetime_secs", &self.url_token_lifetime_secs)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .finish()
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64, AuthError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| AuthError::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_session_policy() {
        let config = AuthConfig::default();
        assert_eq!(config.session_lifetime_secs, 45 * 60);
        assert_eq!(config.refresh_lifetime_secs, 24 * 60 * 60);
        assert_eq!(config.url_token_lifetime_secs, 72 * 60 * 60);
        assert_eq!(config.bcrypt_cost, 10);
    }

    #[test]
    fn low_cost_is_raised() {
        let config = AuthConfig {
            bcrypt_cost: 4,
            ..AuthConfig::default()
        };
        assert_eq!(config.effective_bcrypt_cost(), MIN_BCRYPT_COST);
    }

    #[test]
    fn debug_hides_signing_secret() {
        let config = AuthConfig {
            signing_secret: "do-not-print-me".into(),
            ..AuthConfig::default()
        };
        assert!(!format!("{config:?}").contains("do-not-print-me"));
    }
}
