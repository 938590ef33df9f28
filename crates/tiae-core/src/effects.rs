//! Side effects that run only after a transactional context commits.
//!
//! Handlers never talk to the object store, the orchestrator or the email
//! sender directly. They stage a [`PostCommit`] on their context; once the
//! database commit succeeds the dispatcher runs the staged effects in
//! [`EffectPhase`] order (IAM, then orchestrator, then email).

use std::fmt;

use uuid::Uuid;

use crate::models::email::OutboundEmail;

/// Execution phase of an effect. Lower phases run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EffectPhase {
    Iam,
    Orchestrator,
    Email,
    Cleanup,
}

#[derive(Clone, PartialEq, Eq)]
pub enum PostCommit {
    /// Create the IAM user for a new service account, then sync its policy.
    ProvisionServiceAccount {
        tenant: String,
        service_account_id: Uuid,
        access_key: String,
        secret_key: String,
    },
    /// Bring the IAM status and policy of a service account in line with
    /// the committed database state.
    SyncServiceAccount {
        tenant: String,
        service_account_id: Uuid,
    },
    RemoveServiceAccount {
        tenant: String,
        service_account_id: Uuid,
        access_key: String,
    },
    /// Write the tenant root credentials into the orchestrator secret
    /// `<tenant>-env`.
    StoreTenantCredentials {
        tenant: String,
        access_key: String,
        secret_key: String,
    },
    /// Rewrite the reverse-proxy ConfigMap from the live tenant set.
    SyncProxyConfig,
    SendEmail(OutboundEmail),
    /// Drop the cached connection pool of a deleted tenant.
    EvictTenantConnection { tenant: String },
}

impl PostCommit {
    pub fn phase(&self) -> EffectPhase {
        match self {
            PostCommit::ProvisionServiceAccount { .. }
            | PostCommit::SyncServiceAccount { .. }
            | PostCommit::RemoveServiceAccount { .. } => EffectPhase::Iam,
            PostCommit::StoreTenantCredentials { .. } | PostCommit::SyncProxyConfig => {
                EffectPhase::Orchestrator
            }
            PostCommit::SendEmail(_) => EffectPhase::Email,
            PostCommit::EvictTenantConnection { .. } => EffectPhase::Cleanup,
        }
    }

    /// Short label used in logs and reconciliation events.
    pub fn target(&self) -> String {
        match self {
            PostCommit::ProvisionServiceAccount {
                tenant, access_key, ..
            } => format!("iam-user:{tenant}/{access_key}"),
            PostCommit::SyncServiceAccount {
                tenant,
                service_account_id,
            } => format!("service-account:{tenant}/{service_account_id}"),
            PostCommit::RemoveServiceAccount {
                tenant, access_key, ..
            } => {
                format!("iam-user:{tenant}/{access_key}")
            }
            PostCommit::StoreTenantCredentials { tenant, .. } => format!("secret:{tenant}-env"),
            PostCommit::SyncProxyConfig => "configmap:nginx-configuration".to_string(),
            PostCommit::SendEmail(email) => format!("email:{}", email.to),
            PostCommit::EvictTenantConnection { tenant } => format!("connection:{tenant}"),
        }
    }
}

impl fmt::Debug for PostCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostCommit::SendEmail(email) => f
                .debug_struct("SendEmail")
                .field("to", &email.to)
                .field("subject", &email.subject)
                .finish(),
            other => f.write_str(&other.target()),
        }
    }
}

/// Order staged effects for dispatch.
///
/// Effects are stably sorted by phase so that staging order is kept inside
/// a phase. Repeated syncs of the same target collapse to one.
pub fn ordered(mut effects: Vec<PostCommit>) -> Vec<PostCommit> {
    effects.sort_by_key(PostCommit::phase);
    let mut out: Vec<PostCommit> = Vec::with_capacity(effects.len());
    for effect in effects {
        let collapsible = matches!(
            effect,
            PostCommit::SyncServiceAccount { .. } | PostCommit::SyncProxyConfig
        );
        if collapsible && out.contains(&effect) {
            continue;
        }
        out.push(effect);
    }
    out
}
