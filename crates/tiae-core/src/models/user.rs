//! User domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    /// Stored lowercased; unique within the tenant.
    pub email: String,
    /// bcrypt hash. `None` until the user redeems an invite.
    pub password_hash: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUser {
    pub name: String,
    pub email: String,
    /// Raw initial password. When absent the user starts disabled until an
    /// invite is redeemed.
    pub password: Option<String>,
}
