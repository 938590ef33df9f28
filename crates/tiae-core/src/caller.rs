//! Who is making a request.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Admin,
    /// Work started by the process itself (setup, sweeps).
    System,
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrincipalKind::User => "user",
            PrincipalKind::Admin => "admin",
            PrincipalKind::System => "system",
        })
    }
}

/// The acting identity recorded on a transactional context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub id: Uuid,
    /// Display form for logs, usually the email address.
    pub who_am_i: String,
}

impl Principal {
    pub fn system() -> Self {
        Self {
            kind: PrincipalKind::System,
            id: Uuid::nil(),
            who_am_i: "system".into(),
        }
    }
}

/// Lowercased request metadata as received at the RPC boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerMetadata {
    entries: HashMap<String, String>,
}

impl CallerMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Case-insensitive lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Identity resolved by the authentication interceptor and handed to the
/// request handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub session_id: Uuid,
    pub principal: Principal,
    pub tenant_id: Option<Uuid>,
    pub tenant_short_name: Option<String>,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.principal.kind == PrincipalKind::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_lookup_ignores_case() {
        let md = CallerMetadata::new().with("sessionId", "abc");
        assert_eq!(md.get("sessionid"), Some("abc"));
        assert_eq!(md.get("SESSIONID"), Some("abc"));
        assert_eq!(md.get("token"), None);
    }
}
