//! Tenant domain model.
//!
//! Tenants live in the global catalog. Every per-tenant entity (users,
//! service accounts, permissions, sessions, URL tokens) lives in a database
//! schema named after the tenant's short name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A customer of the control plane with its own schema and object-store
/// namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: Uuid,
    /// Human-readable display name (e.g. `Acme Inc`).
    pub name: String,
    /// DNS-label identifier; also the schema name. Immutable once created.
    pub short_name: String,
    pub enabled: bool,
    pub cost_per_gb: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to create a new tenant together with its first user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTenant {
    pub name: String,
    pub short_name: String,
    pub first_user_name: String,
    pub first_user_email: String,
    pub cost_per_gb: Option<f64>,
}
