//! One-shot URL tokens backing email links.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TiaeError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UrlTokenPurpose {
    Signup,
    Reset,
    Forgot,
}

impl UrlTokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlTokenPurpose::Signup => "signup",
            UrlTokenPurpose::Reset => "reset",
            UrlTokenPurpose::Forgot => "forgot",
        }
    }

    /// Path segment of the console page that redeems this purpose.
    pub fn console_path(&self) -> &'static str {
        match self {
            UrlTokenPurpose::Signup => "signup",
            UrlTokenPurpose::Reset | UrlTokenPurpose::Forgot => "reset-password",
        }
    }
}

impl FromStr for UrlTokenPurpose {
    type Err = TiaeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signup" => Ok(UrlTokenPurpose::Signup),
            "reset" => Ok(UrlTokenPurpose::Reset),
            "forgot" => Ok(UrlTokenPurpose::Forgot),
            other => Err(TiaeError::InvalidArgument(format!(
                "unknown URL token purpose: {other}"
            ))),
        }
    }
}

impl fmt::Display for UrlTokenPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a URL token is stored: a tenant schema (owner is a user) or the
/// global catalog (owner is an admin).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlTokenScope {
    Tenant,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UrlToken {
    pub id: Uuid,
    /// User id for tenant tokens, admin id for admin tokens.
    pub owner_id: Uuid,
    pub purpose: UrlTokenPurpose,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlTokenStatus {
    Valid,
    Expired,
    Consumed,
}

impl UrlToken {
    /// Consumption wins over expiry so a replayed link reports
    /// `AlreadyConsumed` even after its deadline.
    pub fn status_at(&self, now: DateTime<Utc>) -> UrlTokenStatus {
        if self.consumed {
            UrlTokenStatus::Consumed
        } else if now < self.expires_at {
            UrlTokenStatus::Valid
        } else {
            UrlTokenStatus::Expired
        }
    }

    /// Returns `Ok(())` only for a valid token of one of the `accepted`
    /// purposes.
    pub fn ensure_redeemable(
        &self,
        now: DateTime<Utc>,
        accepted: &[UrlTokenPurpose],
    ) -> Result<(), TiaeError> {
        if !accepted.contains(&self.purpose) {
            return Err(TiaeError::InvalidToken(format!(
                "token purpose {} not accepted here",
                self.purpose
            )));
        }
        match self.status_at(now) {
            UrlTokenStatus::Valid => Ok(()),
            UrlTokenStatus::Expired => Err(TiaeError::Expired),
            UrlTokenStatus::Consumed => Err(TiaeError::AlreadyConsumed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(purpose: UrlTokenPurpose, ttl: Duration, consumed: bool) -> UrlToken {
        let now = Utc::now();
        UrlToken {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            purpose,
            expires_at: now + ttl,
            consumed,
            created_at: now,
        }
    }

    #[test]
    fn fresh_token_is_valid() {
        let t = token(UrlTokenPurpose::Signup, Duration::hours(1), false);
        assert_eq!(t.status_at(Utc::now()), UrlTokenStatus::Valid);
        assert!(t.ensure_redeemable(Utc::now(), &[UrlTokenPurpose::Signup]).is_ok());
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let t = token(UrlTokenPurpose::Reset, Duration::hours(1), false);
        assert_eq!(t.status_at(t.expires_at), UrlTokenStatus::Expired);
        assert!(matches!(
            t.ensure_redeemable(t.expires_at, &[UrlTokenPurpose::Reset]),
            Err(TiaeError::Expired)
        ));
    }

    #[test]
    fn consumed_wins_over_expired() {
        let t = token(UrlTokenPurpose::Signup, Duration::hours(-1), true);
        assert_eq!(t.status_at(Utc::now()), UrlTokenStatus::Consumed);
    }

    #[test]
    fn wrong_purpose_is_rejected() {
        let t = token(UrlTokenPurpose::Forgot, Duration::hours(1), false);
        assert!(matches!(
            t.ensure_redeemable(Utc::now(), &[UrlTokenPurpose::Signup]),
            Err(TiaeError::InvalidToken(_))
        ));
    }
}
