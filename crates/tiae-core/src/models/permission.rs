//! Permission domain model.
//!
//! A permission is an `(effect, resources, actions)` triple. Resources are
//! bucket names (optionally with a prefix or pattern); actions are coarse
//! read/write grants that the synchronizer expands into object-store
//! actions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TiaeError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }

    /// Capitalized form used in IAM policy statements.
    pub fn policy_effect(&self) -> &'static str {
        match self {
            Effect::Allow => "Allow",
            Effect::Deny => "Deny",
        }
    }
}

impl FromStr for Effect {
    type Err = TiaeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(Effect::Allow),
            "deny" => Ok(Effect::Deny),
            other => Err(TiaeError::InvalidArgument(format!(
                "effect must be allow or deny, got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Read,
    Write,
    #[serde(rename = "readwrite")]
    ReadWrite,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Read => "read",
            ActionType::Write => "write",
            ActionType::ReadWrite => "readwrite",
        }
    }

    /// Object-store actions granted by this action type.
    pub fn s3_actions(&self) -> &'static [&'static str] {
        const READ: &[&str] = &["s3:GetObject", "s3:ListBucket"];
        const WRITE: &[&str] = &["s3:PutObject", "s3:DeleteObject"];
        const BOTH: &[&str] = &[
            "s3:GetObject",
            "s3:ListBucket",
            "s3:PutObject",
            "s3:DeleteObject",
        ];
        match self {
            ActionType::Read => READ,
            ActionType::Write => WRITE,
            ActionType::ReadWrite => BOTH,
        }
    }
}

impl FromStr for ActionType {
    type Err = TiaeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(ActionType::Read),
            "write" => Ok(ActionType::Write),
            "readwrite" => Ok(ActionType::ReadWrite),
            other => Err(TiaeError::InvalidArgument(format!(
                "action must be read, write or readwrite, got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionResource {
    pub id: Uuid,
    pub permission_id: Uuid,
    pub bucket_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionAction {
    pub id: Uuid,
    pub permission_id: Uuid,
    pub action: ActionType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Permission {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub effect: Effect,
    pub resources: Vec<PermissionResource>,
    pub actions: Vec<PermissionAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePermission {
    pub name: String,
    pub description: Option<String>,
    pub effect: Effect,
    /// Bucket names, possibly with a prefix (`logs/2024/*`).
    pub resources: Vec<String>,
    pub actions: Vec<ActionType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdatePermission {
    pub name: Option<String>,
    /// `Some(None)` clears the description.
    pub description: Option<Option<String>>,
    pub effect: Option<Effect>,
    pub resources: Option<Vec<String>>,
    pub actions: Option<Vec<ActionType>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effect_parses_case_insensitively() {
        assert_eq!("Allow".parse::<Effect>().unwrap(), Effect::Allow);
        assert_eq!("deny".parse::<Effect>().unwrap(), Effect::Deny);
        assert!("maybe".parse::<Effect>().is_err());
    }

    #[test]
    fn readwrite_expands_to_both_sets() {
        let rw = ActionType::ReadWrite.s3_actions();
        for action in ActionType::Read
            .s3_actions()
            .iter()
            .chain(ActionType::Write.s3_actions())
        {
            assert!(rw.contains(action), "{action} missing from readwrite");
        }
        assert_eq!(rw.len(), 4);
    }
}
