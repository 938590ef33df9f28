//! Authorization synchronizer: projects service accounts and their
//! permissions onto the tenant's object-store IAM.
//!
//! Every run reads committed state afresh and converges IAM to it, so
//! repeating a run is harmless and a later run makes earlier pending
//! retries redundant. Runs are numbered per service account; a retry loop
//! whose number is no longer the latest stops.

use std::sync::Arc;

use dashmap::DashMap;
use tiae_core::models::service_account::ServiceAccountGrant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapters::{AdminClientProvider, ObjectStoreAdmin};
use crate::directory::Directory;
use crate::error::AdapterError;
use crate::policy::PolicyDocument;

/// External writes issued by one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub writes: u32,
}

impl SyncReport {
    fn add(&mut self, other: SyncReport) {
        self.writes += other.writes;
    }
}

pub struct AuthorizationSynchronizer {
    clients: Arc<dyn AdminClientProvider>,
    directory: Arc<dyn Directory>,
    generations: DashMap<(String, Uuid), u64>,
}

impl AuthorizationSynchronizer {
    pub fn new(clients: Arc<dyn AdminClientProvider>, directory: Arc<dyn Directory>) -> Self {
        Self {
            clients,
            directory,
            generations: DashMap::new(),
        }
    }

    /// Start a new run for a service account, superseding older ones.
    pub fn begin(&self, tenant: &str, service_account_id: Uuid) -> u64 {
        let mut entry = self
            .generations
            .entry((tenant.to_string(), service_account_id))
            .or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn is_current(&self, tenant: &str, service_account_id: Uuid, generation: u64) -> bool {
        self.generations
            .get(&(tenant.to_string(), service_account_id))
            .map(|g| *g == generation)
            .unwrap_or(true)
    }

    /// Drop the run counter of a deleted service account.
    pub fn forget(&self, tenant: &str, service_account_id: Uuid) {
        self.generations
            .remove(&(tenant.to_string(), service_account_id));
    }

    /// Drop every run counter of a deleted tenant.
    pub fn forget_tenant(&self, tenant: &str) {
        self.generations.retain(|(t, _), _| t != tenant);
    }

    pub fn tracked(&self) -> usize {
        self.generations.len()
    }

    /// Create the IAM user with its credentials, then bring its status and
    /// policy in line with the database.
    pub async fn provision(
        &self,
        tenant: &str,
        service_account_id: Uuid,
        access_key: &str,
        secret_key: &str,
    ) -> Result<SyncReport, AdapterError> {
        let client = self.clients.admin_client(tenant).await?;
        client.add_user(access_key, secret_key).await?;
        let mut report = SyncReport { writes: 1 };
        info!(%tenant, access_key, "IAM user provisioned");
        report.add(self.sync(tenant, service_account_id).await?);
        Ok(report)
    }

    /// Converge one service account. A deleted account is a no-op; its
    /// removal is a separate action.
    pub async fn sync(
        &self,
        tenant: &str,
        service_account_id: Uuid,
    ) -> Result<SyncReport, AdapterError> {
        let Some(grant) = self.directory.load_grant(tenant, service_account_id).await? else {
            debug!(%tenant, %service_account_id, "Service account gone, nothing to sync");
            return Ok(SyncReport::default());
        };
        let client = self.clients.admin_client(tenant).await?;
        let report = apply(client.as_ref(), &grant).await?;
        if report.writes > 0 {
            info!(
                %tenant,
                service_account = %grant.access_key,
                writes = report.writes,
                "Service account synchronized"
            );
        }
        Ok(report)
    }

    /// Remove the IAM user and its canned policy. Missing users are fine.
    pub async fn remove(
        &self,
        tenant: &str,
        service_account_id: Uuid,
        access_key: &str,
    ) -> Result<SyncReport, AdapterError> {
        let client = self.clients.admin_client(tenant).await?;
        let Some(user) = client.get_user_info(access_key).await? else {
            self.forget(tenant, service_account_id);
            return Ok(SyncReport::default());
        };
        client.remove_user(access_key).await?;
        let mut report = SyncReport { writes: 1 };
        if let Some(policy) = user.policy_name {
            client.remove_canned_policy(&policy).await?;
            report.writes += 1;
        }
        self.forget(tenant, service_account_id);
        info!(%tenant, access_key, "IAM user removed");
        Ok(report)
    }

    /// Replace the IAM secret of an existing user.
    pub async fn set_secret(
        &self,
        tenant: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<(), AdapterError> {
        let client = self.clients.admin_client(tenant).await?;
        client.add_user(access_key, secret_key).await
    }
}

/// Diff IAM against `grant` and issue only the writes that differ.
///
/// An IAM user that does not exist yet is left alone: its pending
/// provisioning applies the committed grant once it creates the user.
pub async fn apply(
    client: &dyn ObjectStoreAdmin,
    grant: &ServiceAccountGrant,
) -> Result<SyncReport, AdapterError> {
    let Some(user) = client.get_user_info(&grant.access_key).await? else {
        debug!(service_account = %grant.access_key, "IAM user not provisioned yet, skipping sync");
        return Ok(SyncReport::default());
    };
    let mut report = SyncReport::default();

    match PolicyDocument::build(&grant.permissions) {
        Some(document) => {
            let json = document.to_json()?;
            let name = document.name_for(&grant.access_key)?;
            if user.policy_name.as_deref() != Some(name.as_str()) {
                client.add_canned_policy(&name, &json).await?;
                client.set_policy(&name, &grant.access_key, false).await?;
                report.writes += 2;
                if let Some(old) = user.policy_name.as_deref() {
                    client.remove_canned_policy(old).await?;
                    report.writes += 1;
                }
            }
        }
        None => {
            if let Some(old) = user.policy_name.as_deref() {
                client.remove_canned_policy(old).await?;
                report.writes += 1;
            }
        }
    }

    if user.enabled != grant.enabled {
        client
            .set_user_status(&grant.access_key, grant.enabled)
            .await?;
        report.writes += 1;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{IamOp, InMemoryObjectStore};
    use crate::directory::InMemoryDirectory;
    use chrono::Utc;
    use tiae_core::models::permission::{
        ActionType, Effect, Permission, PermissionAction, PermissionResource,
    };

    fn rw_logs() -> Permission {
        let id = Uuid::new_v4();
        Permission {
            id,
            slug: "rw-logs".into(),
            name: "rw-logs".into(),
            description: None,
            effect: Effect::Allow,
            resources: vec![PermissionResource {
                id: Uuid::new_v4(),
                permission_id: id,
                bucket_name: "logs".into(),
            }],
            actions: vec![PermissionAction {
                id: Uuid::new_v4(),
                permission_id: id,
                action: ActionType::ReadWrite,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn fixture() -> (Arc<InMemoryObjectStore>, Arc<InMemoryDirectory>, AuthorizationSynchronizer, Uuid) {
        let store = Arc::new(InMemoryObjectStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let id = Uuid::new_v4();
        directory
            .put_grant(
                "acme",
                ServiceAccountGrant {
                    service_account_id: id,
                    access_key: "LOGSWRITER000001".into(),
                    enabled: true,
                    permissions: vec![rw_logs()],
                },
            )
            .await;
        let sync = AuthorizationSynchronizer::new(store.clone(), directory.clone());
        (store, directory, sync, id)
    }

    #[tokio::test]
    async fn second_sync_writes_nothing() {
        let (store, _, sync, id) = fixture().await;
        store.tenant("acme").add_user("LOGSWRITER000001", "secret").await.unwrap();

        let first = sync.sync("acme", id).await.unwrap();
        assert_eq!(first.writes, 2);
        assert_eq!(store.tenant("acme").policy_puts(), 1);

        let writes_before = store.tenant("acme").writes();
        let second = sync.sync("acme", id).await.unwrap();
        assert_eq!(second.writes, 0);
        assert_eq!(store.tenant("acme").writes(), writes_before);
        assert_eq!(store.tenant("acme").policy_puts(), 1);
    }

    #[tokio::test]
    async fn changed_permissions_replace_the_old_policy() {
        let (store, directory, sync, id) = fixture().await;
        let iam = store.tenant("acme");
        iam.add_user("LOGSWRITER000001", "secret").await.unwrap();
        sync.sync("acme", id).await.unwrap();
        let old = iam.get_user_info("LOGSWRITER000001").await.unwrap().unwrap().policy_name;

        let mut narrowed = rw_logs();
        narrowed.actions[0].action = ActionType::Read;
        directory
            .put_grant(
                "acme",
                ServiceAccountGrant {
                    service_account_id: id,
                    access_key: "LOGSWRITER000001".into(),
                    enabled: false,
                    permissions: vec![narrowed],
                },
            )
            .await;
        let report = sync.sync("acme", id).await.unwrap();
        assert_eq!(report.writes, 4);

        let info = iam.get_user_info("LOGSWRITER000001").await.unwrap().unwrap();
        assert!(!info.enabled);
        assert_ne!(info.policy_name, old);
        assert!(iam.policy_document(old.as_deref().unwrap()).await.is_none());
        let doc = iam.attached_document("LOGSWRITER000001").await.unwrap();
        assert!(doc.contains("s3:GetObject"));
        assert!(!doc.contains("s3:PutObject"));
    }

    #[tokio::test]
    async fn sync_before_provisioning_waits_for_the_user() {
        let (store, _, sync, id) = fixture().await;
        assert_eq!(sync.sync("acme", id).await.unwrap().writes, 0);
        assert_eq!(store.tenant("acme").writes(), 0);

        // Provisioning applies the same grant afterwards.
        let report = sync.provision("acme", id, "LOGSWRITER000001", "secret").await.unwrap();
        assert_eq!(report.writes, 3);
        assert!(store.tenant("acme").attached_document("LOGSWRITER000001").await.is_some());
    }

    #[tokio::test]
    async fn injected_failure_surfaces_as_transient() {
        let (store, _, sync, id) = fixture().await;
        let iam = store.tenant("acme");
        iam.add_user("LOGSWRITER000001", "secret").await.unwrap();
        iam.fail_next(IamOp::SetPolicy, 1).await;
        assert!(sync.sync("acme", id).await.unwrap_err().is_transient());
        // The retry converges.
        assert_eq!(sync.sync("acme", id).await.unwrap().writes, 2);
        assert!(iam.attached_document("LOGSWRITER000001").await.is_some());
    }

    #[tokio::test]
    async fn removal_takes_the_policy_with_it() {
        let (store, _, sync, id) = fixture().await;
        sync.begin("acme", id);
        sync.provision("acme", id, "LOGSWRITER000001", "secret").await.unwrap();
        let iam = store.tenant("acme");
        let policy = iam
            .get_user_info("LOGSWRITER000001")
            .await
            .unwrap()
            .unwrap()
            .policy_name
            .unwrap();

        let report = sync.remove("acme", id, "LOGSWRITER000001").await.unwrap();
        assert_eq!(report.writes, 2);
        assert_eq!(iam.user_count().await, 0);
        assert!(iam.policy_document(&policy).await.is_none());
        assert_eq!(sync.tracked(), 0);
        assert_eq!(sync.remove("acme", id, "LOGSWRITER000001").await.unwrap().writes, 0);
    }

    #[test]
    fn deleted_tenants_release_their_counters() {
        let sync = AuthorizationSynchronizer::new(
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(InMemoryDirectory::new()),
        );
        sync.begin("acme", Uuid::new_v4());
        sync.begin("acme", Uuid::new_v4());
        sync.begin("beta", Uuid::new_v4());
        sync.forget_tenant("acme");
        assert_eq!(sync.tracked(), 1);
    }

    #[test]
    fn newer_runs_supersede_older_ones() {
        let sync = AuthorizationSynchronizer::new(
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(InMemoryDirectory::new()),
        );
        let id = Uuid::new_v4();
        let first = sync.begin("acme", id);
        assert!(sync.is_current("acme", id, first));
        let second = sync.begin("acme", id);
        assert!(!sync.is_current("acme", id, first));
        assert!(sync.is_current("acme", id, second));
        assert!(sync.is_current("beta", id, 1));
    }
}
