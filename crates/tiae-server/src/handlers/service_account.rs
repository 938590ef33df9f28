use tiae_core::error::TiaeResult;
use tiae_core::models::service_account::{
    CreateServiceAccount, ServiceAccount, ServiceAccountCredential, UpdateServiceAccount,
};
use tiae_db::store::service_account;
use tiae_sync::{AdapterError, ReconciliationNeeded};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::control::{Call, ControlPlane};

impl ControlPlane {
    /// The returned credential carries the only copy of the secret the
    /// caller will ever see.
    pub async fn add_service_account(
        &self,
        call: &Call,
        tenant: &str,
        input: CreateServiceAccount,
    ) -> TiaeResult<(ServiceAccount, ServiceAccountCredential)> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            service_account::add_service_account(&mut ctx, tenant, input).await
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn get_service_account_by_id(
        &self,
        call: &Call,
        tenant: &str,
        id: Uuid,
    ) -> TiaeResult<ServiceAccount> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            service_account::get_service_account_by_id(&mut ctx, id).await
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn get_service_account_by_slug(
        &self,
        call: &Call,
        tenant: &str,
        slug: &str,
    ) -> TiaeResult<ServiceAccount> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            service_account::get_service_account_by_slug(&mut ctx, slug).await
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn list_service_accounts(
        &self,
        call: &Call,
        tenant: &str,
    ) -> TiaeResult<Vec<ServiceAccount>> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            service_account::list_service_accounts(&mut ctx).await
        }
        .await;
        self.finish(ctx, result).await
    }

    /// IAM status and policy follow after commit.
    pub async fn update_service_account_fields(
        &self,
        call: &Call,
        tenant: &str,
        id: Uuid,
        update: UpdateServiceAccount,
    ) -> TiaeResult<ServiceAccount> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            service_account::update_service_account_fields(&mut ctx, id, update).await
        }
        .await;
        self.finish(ctx, result).await
    }

    /// Remove the database rows; the IAM user goes after commit.
    pub async fn delete_service_account(
        &self,
        call: &Call,
        tenant: &str,
        id: Uuid,
    ) -> TiaeResult<ServiceAccount> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            service_account::delete_service_account(&mut ctx, id).await
        }
        .await;
        self.finish(ctx, result).await
    }

    /// Replace the secret in the database and in IAM together.
    ///
    /// The IAM write happens while the database transaction is still open:
    /// if IAM refuses, the transaction rolls back; if the commit then
    /// fails, the previous secret is written back to IAM. A failed restore
    /// is reported as a reconciliation event.
    pub async fn rotate_service_account_secret(
        &self,
        call: &Call,
        tenant: &str,
        id: Uuid,
    ) -> TiaeResult<ServiceAccountCredential> {
        let mut ctx = self.begin(call);
        let staged = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            service_account::rotate_secret(&mut ctx, id).await
        }
        .await;
        let (credential, previous) = match staged {
            Ok(v) => v,
            Err(err) => {
                ctx.rollback().await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .write_iam_secret(tenant, &credential.access_key, &credential.secret_key)
            .await
        {
            warn!(%tenant, access_key = %credential.access_key, error = %err, "IAM refused new secret, rolling back");
            ctx.rollback().await;
            return Err(err.into());
        }

        match ctx.commit().await {
            Ok(effects) => {
                self.dispatch(effects).await;
                info!(%tenant, access_key = %credential.access_key, "Service account secret rotated");
                Ok(credential)
            }
            Err(err) => {
                error!(%tenant, access_key = %credential.access_key, error = %err, "Commit failed after IAM rotation, restoring previous secret");
                if let Err(restore) = self
                    .write_iam_secret(tenant, &credential.access_key, &previous)
                    .await
                {
                    self.dispatcher.events().publish(ReconciliationNeeded {
                        target: format!("iam-user:{tenant}/{}", credential.access_key),
                        attempts: 1,
                        last_error: restore.to_string(),
                        incident_id: Uuid::new_v4(),
                    });
                }
                Err(err)
            }
        }
    }

    async fn write_iam_secret(
        &self,
        tenant: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<(), AdapterError> {
        let timeout = self.dispatcher.config().call_timeout;
        let write = self
            .dispatcher
            .synchronizer()
            .set_secret(tenant, access_key, secret_key);
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout),
        }
    }
}
