//! Session domain model.
//!
//! Session state only ever moves forward: a `valid` session may become
//! `invalid` (logout, credential change, user disabled) or `expired`
//! (timeout). Nothing returns to `valid`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TiaeError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Valid,
    Invalid,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Valid => "valid",
            SessionStatus::Invalid => "invalid",
            SessionStatus::Expired => "expired",
        }
    }

    /// Allowed transitions: `valid → invalid` and `valid → expired`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Valid, SessionStatus::Invalid)
                | (SessionStatus::Valid, SessionStatus::Expired)
        )
    }
}

impl FromStr for SessionStatus {
    type Err = TiaeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(SessionStatus::Valid),
            "invalid" => Ok(SessionStatus::Invalid),
            "expired" => Ok(SessionStatus::Expired),
            other => Err(TiaeError::Internal(format!("unknown session status: {other}"))),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An interactive tenant-user session. The id is the bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub status: SessionStatus,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Only `valid` sessions that have not timed out authorize requests.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Valid && now < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSession {
    pub id: Uuid,
    pub admin_id: Uuid,
    pub status: SessionStatus,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AdminSession {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Valid && now < self.expires_at
    }
}

/// Tokens handed back to a client after login, signup or refresh.
///
/// The refresh token is returned once and only its hash is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedSession {
    pub session_id: Uuid,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn transitions_are_monotone() {
        use SessionStatus::*;
        assert!(Valid.can_transition_to(Invalid));
        assert!(Valid.can_transition_to(Expired));
        for from in [Invalid, Expired] {
            for to in [Valid, Invalid, Expired] {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
        assert!(!Valid.can_transition_to(Valid));
    }

    #[test]
    fn expired_or_invalid_sessions_are_unusable() {
        let now = Utc::now();
        let mut session = Session {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            status: SessionStatus::Valid,
            expires_at: now + Duration::minutes(5),
            refresh_expires_at: now + Duration::hours(1),
            created_at: now,
        };
        assert!(session.is_usable_at(now));
        assert!(!session.is_usable_at(now + Duration::minutes(5)));
        session.status = SessionStatus::Invalid;
        assert!(!session.is_usable_at(now));
    }
}
