//! Object-store IAM administration.
//!
//! Each tenant has its own object-store deployment; an
//! [`AdminClientProvider`] hands out the admin client for a tenant. IAM
//! user names are service-account access keys.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::AdapterError;

/// What the object store reports about one IAM user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub enabled: bool,
    /// Canned policy currently attached, if any.
    pub policy_name: Option<String>,
}

#[async_trait]
pub trait ObjectStoreAdmin: Send + Sync {
    /// Create the user, or replace its secret when it exists.
    async fn add_user(&self, access_key: &str, secret_key: &str) -> Result<(), AdapterError>;

    async fn set_user_status(&self, access_key: &str, enabled: bool) -> Result<(), AdapterError>;

    /// Store `document` under `name`, replacing any previous document.
    async fn add_canned_policy(&self, name: &str, document: &str) -> Result<(), AdapterError>;

    async fn set_policy(
        &self,
        policy_name: &str,
        user_or_group: &str,
        is_group: bool,
    ) -> Result<(), AdapterError>;

    async fn remove_user(&self, access_key: &str) -> Result<(), AdapterError>;

    /// `None` when the user does not exist.
    async fn get_user_info(&self, access_key: &str) -> Result<Option<UserInfo>, AdapterError>;

    /// Delete a canned policy, detaching it from every user.
    async fn remove_canned_policy(&self, name: &str) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait AdminClientProvider: Send + Sync {
    async fn admin_client(&self, tenant: &str) -> Result<Arc<dyn ObjectStoreAdmin>, AdapterError>;
}

/// Mutating IAM operations, used to aim injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IamOp {
    AddUser,
    SetUserStatus,
    AddCannedPolicy,
    SetPolicy,
    RemoveUser,
    RemoveCannedPolicy,
}

#[derive(Debug, Clone)]
struct IamUser {
    secret_key: String,
    enabled: bool,
    policy: Option<String>,
}

#[derive(Debug, Default)]
struct IamState {
    users: BTreeMap<String, IamUser>,
    policies: BTreeMap<String, String>,
    faults: HashMap<IamOp, u32>,
    rejections: HashMap<IamOp, u32>,
}

/// In-memory IAM of one tenant. Counts writes and can fail chosen
/// operations.
#[derive(Debug, Default)]
pub struct TenantIam {
    state: Mutex<IamState>,
    writes: AtomicU64,
    policy_puts: AtomicU64,
}

impl TenantIam {
    /// Fail the next `times` calls of `op` with a transient error.
    pub async fn fail_next(&self, op: IamOp, times: u32) {
        self.state.lock().await.faults.insert(op, times);
    }

    /// Reject the next `times` calls of `op` with a permanent error.
    pub async fn reject_next(&self, op: IamOp, times: u32) {
        self.state.lock().await.rejections.insert(op, times);
    }

    /// Total successful mutating calls.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Successful canned-policy uploads.
    pub fn policy_puts(&self) -> u64 {
        self.policy_puts.load(Ordering::SeqCst)
    }

    pub async fn policy_document(&self, name: &str) -> Option<String> {
        self.state.lock().await.policies.get(name).cloned()
    }

    pub async fn user_secret(&self, access_key: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .users
            .get(access_key)
            .map(|u| u.secret_key.clone())
    }

    /// Document attached to a user, if any.
    pub async fn attached_document(&self, access_key: &str) -> Option<String> {
        let state = self.state.lock().await;
        let name = state.users.get(access_key)?.policy.as_ref()?;
        state.policies.get(name).cloned()
    }

    pub async fn user_count(&self) -> usize {
        self.state.lock().await.users.len()
    }

    fn check_fault(state: &mut IamState, op: IamOp) -> Result<(), AdapterError> {
        if let Some(left) = state.faults.get_mut(&op) {
            if *left > 0 {
                *left -= 1;
                return Err(AdapterError::Transient(format!("injected {op:?} failure")));
            }
        }
        if let Some(left) = state.rejections.get_mut(&op) {
            if *left > 0 {
                *left -= 1;
                return Err(AdapterError::Rejected(format!("injected {op:?} rejection")));
            }
        }
        Ok(())
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStoreAdmin for TenantIam {
    async fn add_user(&self, access_key: &str, secret_key: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        Self::check_fault(&mut state, IamOp::AddUser)?;
        let user = state
            .users
            .entry(access_key.to_string())
            .or_insert_with(|| IamUser {
                secret_key: String::new(),
                enabled: true,
                policy: None,
            });
        user.secret_key = secret_key.to_string();
        self.wrote();
        Ok(())
    }

    async fn set_user_status(&self, access_key: &str, enabled: bool) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        Self::check_fault(&mut state, IamOp::SetUserStatus)?;
        let user = state
            .users
            .get_mut(access_key)
            .ok_or_else(|| AdapterError::NotFound(format!("user {access_key}")))?;
        user.enabled = enabled;
        self.wrote();
        Ok(())
    }

    async fn add_canned_policy(&self, name: &str, document: &str) -> Result<(), AdapterError> {
        serde_json::from_str::<serde_json::Value>(document)
            .map_err(|e| AdapterError::Rejected(format!("malformed policy: {e}")))?;
        let mut state = self.state.lock().await;
        Self::check_fault(&mut state, IamOp::AddCannedPolicy)?;
        state.policies.insert(name.to_string(), document.to_string());
        self.wrote();
        self.policy_puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_policy(
        &self,
        policy_name: &str,
        user_or_group: &str,
        is_group: bool,
    ) -> Result<(), AdapterError> {
        if is_group {
            return Err(AdapterError::Rejected("groups are not supported".into()));
        }
        let mut state = self.state.lock().await;
        Self::check_fault(&mut state, IamOp::SetPolicy)?;
        if !state.policies.contains_key(policy_name) {
            return Err(AdapterError::NotFound(format!("policy {policy_name}")));
        }
        let user = state
            .users
            .get_mut(user_or_group)
            .ok_or_else(|| AdapterError::NotFound(format!("user {user_or_group}")))?;
        user.policy = Some(policy_name.to_string());
        self.wrote();
        Ok(())
    }

    async fn remove_user(&self, access_key: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        Self::check_fault(&mut state, IamOp::RemoveUser)?;
        if state.users.remove(access_key).is_some() {
            self.wrote();
        }
        Ok(())
    }

    async fn get_user_info(&self, access_key: &str) -> Result<Option<UserInfo>, AdapterError> {
        let state = self.state.lock().await;
        Ok(state.users.get(access_key).map(|u| UserInfo {
            enabled: u.enabled,
            policy_name: u.policy.clone(),
        }))
    }

    async fn remove_canned_policy(&self, name: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        Self::check_fault(&mut state, IamOp::RemoveCannedPolicy)?;
        if state.policies.remove(name).is_some() {
            for user in state.users.values_mut() {
                if user.policy.as_deref() == Some(name) {
                    user.policy = None;
                }
            }
            self.wrote();
        }
        Ok(())
    }
}

/// One [`TenantIam`] per tenant, created on first use.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    tenants: DashMap<String, Arc<TenantIam>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(&self, tenant: &str) -> Arc<TenantIam> {
        self.tenants
            .entry(tenant.to_string())
            .or_default()
            .value()
            .clone()
    }
}

#[async_trait]
impl AdminClientProvider for InMemoryObjectStore {
    async fn admin_client(&self, tenant: &str) -> Result<Arc<dyn ObjectStoreAdmin>, AdapterError> {
        let client: Arc<dyn ObjectStoreAdmin> = self.tenant(tenant);
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn policies_attach_and_detach() {
        let iam = TenantIam::default();
        iam.add_user("AKIA", "secret").await.unwrap();
        iam.add_canned_policy("p1", r#"{"Version":"2012-10-17","Statement":[]}"#)
            .await
            .unwrap();
        iam.set_policy("p1", "AKIA", false).await.unwrap();
        assert_eq!(
            iam.get_user_info("AKIA").await.unwrap().unwrap().policy_name.as_deref(),
            Some("p1")
        );
        iam.remove_canned_policy("p1").await.unwrap();
        assert_eq!(iam.get_user_info("AKIA").await.unwrap().unwrap().policy_name, None);
        assert_eq!(iam.writes(), 4);
        assert_eq!(iam.policy_puts(), 1);
    }

    #[tokio::test]
    async fn injected_faults_fire_once_per_count() {
        let iam = TenantIam::default();
        iam.fail_next(IamOp::AddUser, 1).await;
        assert!(iam.add_user("AKIA", "s").await.unwrap_err().is_transient());
        iam.add_user("AKIA", "s").await.unwrap();
        assert_eq!(iam.writes(), 1);

        iam.reject_next(IamOp::SetPolicy, 1).await;
        iam.add_canned_policy("p1", "{}").await.unwrap();
        assert!(!iam.set_policy("p1", "AKIA", false).await.unwrap_err().is_transient());
        iam.set_policy("p1", "AKIA", false).await.unwrap();
    }

    #[tokio::test]
    async fn provider_hands_out_one_iam_per_tenant() {
        let store = InMemoryObjectStore::new();
        let a = store.admin_client("acme").await.unwrap();
        a.add_user("AKIA", "s").await.unwrap();
        assert_eq!(store.tenant("acme").user_count().await, 1);
        assert_eq!(store.tenant("beta").user_count().await, 0);
    }
}
