//! Service account domain model.
//!
//! A service account is a programmatic identity inside one tenant. Its
//! access key doubles as the IAM user name in the tenant's object store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::permission::Permission;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceAccount {
    pub id: Uuid,
    /// Stable identifier, unique within the tenant.
    pub slug: String,
    pub name: String,
    /// 16 characters from `[A-Z0-9]`. Never changes after creation.
    pub access_key: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The single active secret of a service account.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceAccountCredential {
    pub service_account_id: Uuid,
    pub access_key: String,
    /// 32 printable characters.
    pub secret_key: String,
}

impl fmt::Debug for ServiceAccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountCredential")
            .field("service_account_id", &self.service_account_id)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServiceAccount {
    pub name: String,
    /// Requested slug; derived from the name when absent.
    pub slug: Option<String>,
}

/// Staged update of a service account. `None` leaves a field unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateServiceAccount {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    /// Replaces the full set of assigned permissions.
    pub permission_ids: Option<Vec<Uuid>>,
}

/// Committed state of one service account as the IAM projection sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAccountGrant {
    pub service_account_id: Uuid,
    pub access_key: String,
    pub enabled: bool,
    pub permissions: Vec<Permission>,
}
