//! IAM policy documents derived from a service account's permissions.
//!
//! One statement per effect, carrying the union of actions and resource
//! ARNs of every permission with that effect. Everything is sorted, so the
//! serialized document depends only on the set of inputs and never on
//! their order.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tiae_core::models::permission::{Effect, Permission};

use crate::error::AdapterError;

pub const POLICY_VERSION: &str = "2012-10-17";
const ARN_PREFIX: &str = "arn:aws:s3:::";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    pub effect: &'static str,
    pub action: Vec<String>,
    pub resource: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: &'static str,
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    /// Build the document for `permissions`. `None` when there is nothing
    /// to grant or deny.
    pub fn build(permissions: &[Permission]) -> Option<Self> {
        let mut by_effect: BTreeMap<Effect, (BTreeSet<String>, BTreeSet<String>)> =
            BTreeMap::new();
        for permission in permissions {
            if permission.actions.is_empty() || permission.resources.is_empty() {
                continue;
            }
            let (actions, resources) = by_effect.entry(permission.effect).or_default();
            for a in &permission.actions {
                actions.extend(a.action.s3_actions().iter().map(|s| s.to_string()));
            }
            for r in &permission.resources {
                resources.extend(resource_arns(&r.bucket_name));
            }
        }
        if by_effect.is_empty() {
            return None;
        }
        let statement = by_effect
            .into_iter()
            .map(|(effect, (actions, resources))| Statement {
                effect: effect.policy_effect(),
                action: actions.into_iter().collect(),
                resource: resources.into_iter().collect(),
            })
            .collect();
        Some(Self {
            version: POLICY_VERSION,
            statement,
        })
    }

    /// Compact JSON. Byte-identical for identical documents.
    pub fn to_json(&self) -> Result<String, AdapterError> {
        serde_json::to_string(self)
            .map_err(|e| AdapterError::Rejected(format!("policy document: {e}")))
    }

    /// Canned-policy name for this document attached to `access_key`.
    /// Changes whenever the content changes.
    pub fn name_for(&self, access_key: &str) -> Result<String, AdapterError> {
        let digest = Sha256::digest(self.to_json()?.as_bytes());
        Ok(format!(
            "{}-{}",
            access_key.to_lowercase(),
            &hex::encode(digest)[..16]
        ))
    }
}

/// ARNs granted by one resource entry. A bare bucket covers the bucket and
/// every object in it; `bucket/prefix` covers the bucket and the objects
/// under the prefix.
pub fn resource_arns(resource: &str) -> Vec<String> {
    let resource = resource.trim().trim_start_matches(ARN_PREFIX);
    let (bucket, prefix) = match resource.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
        None => (resource, ""),
    };
    if bucket.is_empty() {
        return Vec::new();
    }
    let objects = if prefix.is_empty() || prefix == "*" {
        format!("{ARN_PREFIX}{bucket}/*")
    } else if prefix.ends_with('*') {
        format!("{ARN_PREFIX}{bucket}/{prefix}")
    } else {
        format!("{ARN_PREFIX}{bucket}/{prefix}/*")
    };
    vec![format!("{ARN_PREFIX}{bucket}"), objects]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tiae_core::models::permission::{ActionType, PermissionAction, PermissionResource};
    use uuid::Uuid;

    fn permission(effect: Effect, buckets: &[&str], actions: &[ActionType]) -> Permission {
        let id = Uuid::new_v4();
        Permission {
            id,
            slug: "p".into(),
            name: "p".into(),
            description: None,
            effect,
            resources: buckets
                .iter()
                .map(|b| PermissionResource {
                    id: Uuid::new_v4(),
                    permission_id: id,
                    bucket_name: b.to_string(),
                })
                .collect(),
            actions: actions
                .iter()
                .map(|a| PermissionAction {
                    id: Uuid::new_v4(),
                    permission_id: id,
                    action: *a,
                })
                .collect(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn readwrite_on_logs() {
        let doc = PolicyDocument::build(&[permission(
            Effect::Allow,
            &["logs"],
            &[ActionType::ReadWrite],
        )])
        .unwrap();
        assert_eq!(
            doc.to_json().unwrap(),
            r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":["s3:DeleteObject","s3:GetObject","s3:ListBucket","s3:PutObject"],"Resource":["arn:aws:s3:::logs","arn:aws:s3:::logs/*"]}]}"#
        );
    }

    #[test]
    fn input_order_does_not_change_the_bytes() {
        let a = permission(Effect::Allow, &["logs", "backups"], &[ActionType::Read]);
        let b = permission(Effect::Allow, &["archive"], &[ActionType::Write]);
        let c = permission(Effect::Deny, &["secret"], &[ActionType::ReadWrite]);
        let one = PolicyDocument::build(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let two = PolicyDocument::build(&[c, b, a]).unwrap();
        assert_eq!(one.to_json().unwrap(), two.to_json().unwrap());
        assert_eq!(one.name_for("AKIA").unwrap(), two.name_for("AKIA").unwrap());
        assert_eq!(one.statement[0].effect, "Allow");
        assert_eq!(one.statement[1].effect, "Deny");
    }

    #[test]
    fn no_permissions_means_no_policy() {
        assert!(PolicyDocument::build(&[]).is_none());
        assert!(PolicyDocument::build(&[permission(Effect::Allow, &[], &[ActionType::Read])]).is_none());
    }

    #[test]
    fn prefixes_narrow_object_arns() {
        assert_eq!(
            resource_arns("logs/2024"),
            vec!["arn:aws:s3:::logs", "arn:aws:s3:::logs/2024/*"]
        );
        assert_eq!(
            resource_arns("logs/2024/*"),
            vec!["arn:aws:s3:::logs", "arn:aws:s3:::logs/2024/*"]
        );
        assert!(resource_arns("  ").is_empty());
    }

    #[test]
    fn name_tracks_content() {
        let read = PolicyDocument::build(&[permission(Effect::Allow, &["logs"], &[ActionType::Read])]).unwrap();
        let write = PolicyDocument::build(&[permission(Effect::Allow, &["logs"], &[ActionType::Write])]).unwrap();
        assert_ne!(read.name_for("AKIA").unwrap(), write.name_for("AKIA").unwrap());
        assert!(read.name_for("AKIA").unwrap().starts_with("akia-"));
    }
}
