//! Transactional context: the unit of work of one request.
//!
//! A context binds the caller to at most two transactions, one on the
//! global catalog and one on a tenant schema, and collects the external
//! side effects that may only run once both have committed. The global
//! transaction is always opened first so every request takes locks in the
//! same order.
//!
//! A context belongs to a single request and is not shared.

use std::sync::Arc;

use sqlx::{PgConnection, Postgres, Transaction};
use tiae_core::caller::{AuthContext, CallerMetadata, Principal, PrincipalKind};
use tiae_core::effects::{self, PostCommit};
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::tenant::Tenant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::connection::ConnectionRegistry;
use crate::error::DbError;

pub struct TxContext {
    registry: Arc<ConnectionRegistry>,
    caller: CallerMetadata,
    auth: Option<AuthContext>,
    principal: Option<Principal>,
    tenant: Option<Tenant>,
    main: Option<Transaction<'static, Postgres>>,
    tenant_tx: Option<Transaction<'static, Postgres>>,
    effects: Vec<PostCommit>,
    cancel: CancellationToken,
}

impl TxContext {
    /// A context with no caller, used by start-up tasks and sweeps.
    pub fn empty(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            caller: CallerMetadata::default(),
            auth: None,
            principal: None,
            tenant: None,
            main: None,
            tenant_tx: None,
            effects: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_caller(registry: Arc<ConnectionRegistry>, caller: CallerMetadata) -> Self {
        Self {
            caller,
            ..Self::empty(registry)
        }
    }

    /// A context for an authenticated caller with its principal attached.
    /// Tenant-scoped callers still need their tenant attached.
    pub fn for_caller(
        registry: Arc<ConnectionRegistry>,
        caller: CallerMetadata,
        auth: AuthContext,
    ) -> Self {
        let principal = auth.principal.clone();
        Self {
            caller,
            principal: Some(principal),
            auth: Some(auth),
            ..Self::empty(registry)
        }
    }

    /// Tie the context to the cancellation signal of the RPC call.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn caller(&self) -> &CallerMetadata {
        &self.caller
    }

    pub fn auth(&self) -> Option<&AuthContext> {
        self.auth.as_ref()
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record who is acting.
    pub fn attach_principal(&mut self, kind: PrincipalKind, id: Uuid, who_am_i: impl Into<String>) {
        self.principal = Some(Principal {
            kind,
            id,
            who_am_i: who_am_i.into(),
        });
    }

    pub fn tenant(&self) -> Option<&Tenant> {
        self.tenant.as_ref()
    }

    pub fn require_tenant(&self) -> TiaeResult<&Tenant> {
        self.tenant.as_ref().ok_or_else(|| DbError::NoTenant.into())
    }

    /// Attach `tenant` and open a transaction on its schema.
    ///
    /// The global transaction is opened first. Fails if a tenant is
    /// already attached.
    pub async fn set_tenant(&mut self, tenant: Tenant) -> TiaeResult<()> {
        if self.tenant.is_some() {
            return Err(DbError::TenantAlreadyAttached.into());
        }
        self.main_tx().await?;
        let pool = self.registry.get_tenant_db(&tenant.short_name).await?;
        let tx = self.guard(pool.begin()).await?;
        debug!(tenant = %tenant.short_name, "Tenant attached to context");
        self.tenant = Some(tenant);
        self.tenant_tx = Some(tx);
        Ok(())
    }

    /// The global-catalog transaction, opened on first use.
    pub async fn main_tx(&mut self) -> TiaeResult<&mut PgConnection> {
        self.check_cancelled()?;
        if self.main.is_none() {
            let pool = self.registry.get_db().clone();
            let tx = self.guard(pool.begin()).await?;
            self.main = Some(tx);
        }
        self.main
            .as_deref_mut()
            .ok_or_else(|| TiaeError::Internal("main transaction unavailable".into()))
    }

    /// The tenant-schema transaction. Requires an attached tenant.
    pub async fn tenant_tx(&mut self) -> TiaeResult<&mut PgConnection> {
        self.check_cancelled()?;
        if self.tenant.is_none() {
            return Err(DbError::NoTenant.into());
        }
        if self.tenant_tx.is_none() {
            // Attached but rolled back earlier in this request: reopen.
            self.main_tx().await?;
            let short_name = self.require_tenant()?.short_name.clone();
            let pool = self.registry.get_tenant_db(&short_name).await?;
            let tx = self.guard(pool.begin()).await?;
            self.tenant_tx = Some(tx);
        }
        self.tenant_tx
            .as_deref_mut()
            .ok_or_else(|| TiaeError::Internal("tenant transaction unavailable".into()))
    }

    /// Stage a side effect to run after a successful commit.
    pub fn after_commit(&mut self, effect: PostCommit) {
        self.effects.push(effect);
    }

    pub fn staged_effects(&self) -> &[PostCommit] {
        &self.effects
    }

    /// Commit the tenant transaction, then the global one, and hand back
    /// the staged effects in dispatch order.
    ///
    /// A tenant commit followed by a failed global commit leaves the two
    /// scopes out of step. That case is logged with an incident id and
    /// returned as [`TiaeError::Fatal`].
    pub async fn commit(mut self) -> TiaeResult<Vec<PostCommit>> {
        if self.cancel.is_cancelled() {
            self.rollback().await;
            return Err(DbError::Cancelled.into());
        }

        let tenant_name = self.tenant.as_ref().map(|t| t.short_name.clone());
        let mut tenant_committed = false;
        if let Some(tx) = self.tenant_tx.take() {
            if let Err(e) = tx.commit().await {
                self.rollback().await;
                return Err(DbError::from(e).into());
            }
            tenant_committed = true;
        }

        if let Some(tx) = self.main.take() {
            if let Err(e) = commit_main(tx).await {
                if tenant_committed {
                    let incident_id = Uuid::new_v4();
                    error!(
                        %incident_id,
                        tenant = tenant_name.as_deref().unwrap_or(""),
                        error = %e,
                        "Tenant transaction committed but global transaction failed"
                    );
                    return Err(TiaeError::Fatal {
                        incident_id,
                        message: format!("global commit failed after tenant commit: {e}"),
                    });
                }
                return Err(DbError::from(e).into());
            }
        }

        Ok(effects::ordered(std::mem::take(&mut self.effects)))
    }

    /// Roll back both transactions and drop staged effects. Safe to call
    /// more than once.
    pub async fn rollback(&mut self) {
        if let Some(tx) = self.tenant_tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "Tenant rollback failed");
            }
        }
        if let Some(tx) = self.main.take() {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "Global rollback failed");
            }
        }
        self.effects.clear();
    }

    fn check_cancelled(&self) -> TiaeResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DbError::Cancelled.into());
        }
        Ok(())
    }

    /// Await a database future unless the request is cancelled first.
    pub async fn guard<T, F>(&self, fut: F) -> TiaeResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DbError::Cancelled.into()),
            res = fut => res.map_err(|e| DbError::from(e).into()),
        }
    }
}

#[cfg(not(test))]
async fn commit_main(tx: Transaction<'static, Postgres>) -> Result<(), sqlx::Error> {
    tx.commit().await
}

#[cfg(test)]
async fn commit_main(tx: Transaction<'static, Postgres>) -> Result<(), sqlx::Error> {
    if failpoints::take_main_commit_failure() {
        return Err(sqlx::Error::Io(std::io::Error::other("failpoint")));
    }
    tx.commit().await
}

#[cfg(test)]
pub(crate) mod failpoints {
    use std::sync::atomic::{AtomicBool, Ordering};

    static FAIL_MAIN_COMMIT: AtomicBool = AtomicBool::new(false);

    pub(crate) struct MainCommitFailGuard;

    impl Drop for MainCommitFailGuard {
        fn drop(&mut self) {
            FAIL_MAIN_COMMIT.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn fail_main_commit() -> MainCommitFailGuard {
        FAIL_MAIN_COMMIT.store(true, Ordering::SeqCst);
        MainCommitFailGuard
    }

    pub(super) fn take_main_commit_failure() -> bool {
        FAIL_MAIN_COMMIT.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DbConfig;
    use sqlx::postgres::PgPoolOptions;
    use tiae_core::error::ErrorKind;

    fn lazy_registry() -> Arc<ConnectionRegistry> {
        let config = DbConfig::default();
        let pool = PgPoolOptions::new().connect_lazy_with(config.provisioning_options().unwrap());
        Arc::new(ConnectionRegistry::with_pool(config, pool))
    }

    #[tokio::test]
    async fn empty_context_commits_without_touching_the_database() {
        let mut ctx = TxContext::empty(lazy_registry());
        ctx.after_commit(PostCommit::SyncProxyConfig);
        let effects = ctx.commit().await.unwrap();
        assert_eq!(effects, vec![PostCommit::SyncProxyConfig]);
    }

    #[tokio::test]
    async fn rollback_is_idempotent_and_drops_effects() {
        let mut ctx = TxContext::empty(lazy_registry());
        ctx.after_commit(PostCommit::SyncProxyConfig);
        ctx.rollback().await;
        ctx.rollback().await;
        assert!(ctx.staged_effects().is_empty());
    }

    #[tokio::test]
    async fn cancelled_context_refuses_work() {
        let cancel = CancellationToken::new();
        let mut ctx = TxContext::empty(lazy_registry()).with_cancellation(cancel.clone());
        cancel.cancel();
        let err = ctx.main_tx().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(ctx.commit().await.is_err());
    }

    #[tokio::test]
    async fn tenant_tx_requires_tenant() {
        let mut ctx = TxContext::empty(lazy_registry());
        assert!(ctx.tenant_tx().await.is_err());
        assert!(ctx.require_tenant().is_err());
    }

    #[tokio::test]
    async fn principal_can_be_attached() {
        let mut ctx = TxContext::empty(lazy_registry());
        let id = Uuid::new_v4();
        ctx.attach_principal(PrincipalKind::Admin, id, "root@example.test");
        assert_eq!(ctx.principal().unwrap().id, id);
    }

    /// Needs a Postgres reachable through `DATABASE_URL`.
    #[tokio::test]
    #[ignore]
    async fn split_commit_is_fatal() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let registry = Arc::new(
            ConnectionRegistry::connect(DbConfig::for_url(&url).unwrap())
                .await
                .unwrap(),
        );
        crate::schema::setup(&registry).await.unwrap();

        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: "Split".into(),
            short_name: format!("split-{}", &Uuid::new_v4().simple().to_string()[..8]),
            enabled: true,
            cost_per_gb: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let mut ctx = TxContext::empty(registry.clone());
        ctx.set_tenant(tenant).await.unwrap();

        let _fail = failpoints::fail_main_commit();
        let err = ctx.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }
}
