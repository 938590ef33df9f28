use tiae_core::error::TiaeResult;
use tiae_core::models::permission::{CreatePermission, Permission, UpdatePermission};
use tiae_db::store::permission;
use uuid::Uuid;

use crate::control::{Call, ControlPlane};

impl ControlPlane {
    pub async fn add_permission(
        &self,
        call: &Call,
        tenant: &str,
        input: CreatePermission,
    ) -> TiaeResult<Permission> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            permission::add_permission(&mut ctx, input).await
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn get_permission(&self, call: &Call, tenant: &str, id: Uuid) -> TiaeResult<Permission> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            permission::get_permission(&mut ctx, id).await
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn get_permission_by_slug(
        &self,
        call: &Call,
        tenant: &str,
        slug: &str,
    ) -> TiaeResult<Permission> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            permission::get_permission_by_slug(&mut ctx, slug).await
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn list_permissions(&self, call: &Call, tenant: &str) -> TiaeResult<Vec<Permission>> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            permission::list_permissions(&mut ctx).await
        }
        .await;
        self.finish(ctx, result).await
    }

    /// Every service account holding the permission is re-synced after
    /// commit.
    pub async fn update_permission(
        &self,
        call: &Call,
        tenant: &str,
        id: Uuid,
        input: UpdatePermission,
    ) -> TiaeResult<Permission> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            permission::update_permission(&mut ctx, id, input).await
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn delete_permission(&self, call: &Call, tenant: &str, id: Uuid) -> TiaeResult<()> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            permission::delete_permission(&mut ctx, id).await
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn assign_permissions_to_sa(
        &self,
        call: &Call,
        tenant: &str,
        service_account_id: Uuid,
        permission_ids: &[Uuid],
    ) -> TiaeResult<()> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            permission::assign_permissions_to_sa(&mut ctx, service_account_id, permission_ids)
                .await
        }
        .await;
        self.finish(ctx, result).await
    }
}
