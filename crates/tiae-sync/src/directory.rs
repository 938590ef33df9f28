//! Committed control-plane state as the post-commit tasks read it.
//!
//! Every read goes through a fresh connection, outside any request
//! transaction, so a retry always sees the latest committed state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::service_account::ServiceAccountGrant;
use tiae_db::store::{service_account, tenant};
use tiae_db::{ConnectionRegistry, DbError};
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait Directory: Send + Sync {
    /// `None` when the service account no longer exists.
    async fn load_grant(
        &self,
        tenant: &str,
        service_account_id: Uuid,
    ) -> TiaeResult<Option<ServiceAccountGrant>>;

    /// Short names of every enabled tenant, sorted.
    async fn live_tenants(&self) -> TiaeResult<Vec<String>>;

    /// Drop any cached connection to a deleted tenant.
    async fn evict_tenant(&self, tenant: &str);
}

/// Reads from Postgres through the connection registry.
pub struct RegistryDirectory {
    registry: Arc<ConnectionRegistry>,
}

impl RegistryDirectory {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Directory for RegistryDirectory {
    async fn load_grant(
        &self,
        tenant: &str,
        service_account_id: Uuid,
    ) -> TiaeResult<Option<ServiceAccountGrant>> {
        let pool = self.registry.get_tenant_db(tenant).await?;
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| TiaeError::from(DbError::from(e)))?;
        service_account::load_grant(&mut conn, service_account_id).await
    }

    async fn live_tenants(&self) -> TiaeResult<Vec<String>> {
        tenant::live_short_names(self.registry.get_db()).await
    }

    async fn evict_tenant(&self, tenant: &str) {
        self.registry.remove_cnx(tenant).await;
    }
}

/// Directory held in memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    grants: RwLock<HashMap<(String, Uuid), ServiceAccountGrant>>,
    tenants: RwLock<Vec<String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_grant(&self, tenant: &str, grant: ServiceAccountGrant) {
        self.grants
            .write()
            .await
            .insert((tenant.to_string(), grant.service_account_id), grant);
    }

    pub async fn remove_grant(&self, tenant: &str, service_account_id: Uuid) {
        self.grants
            .write()
            .await
            .remove(&(tenant.to_string(), service_account_id));
    }

    pub async fn set_tenants(&self, tenants: &[&str]) {
        let mut names: Vec<String> = tenants.iter().map(|t| t.to_string()).collect();
        names.sort();
        *self.tenants.write().await = names;
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn load_grant(
        &self,
        tenant: &str,
        service_account_id: Uuid,
    ) -> TiaeResult<Option<ServiceAccountGrant>> {
        Ok(self
            .grants
            .read()
            .await
            .get(&(tenant.to_string(), service_account_id))
            .cloned())
    }

    async fn live_tenants(&self) -> TiaeResult<Vec<String>> {
        Ok(self.tenants.read().await.clone())
    }

    async fn evict_tenant(&self, tenant: &str) {
        self.tenants.write().await.retain(|t| t != tenant);
    }
}
