use tiae_core::error::TiaeResult;
use tiae_core::models::tenant::{CreateTenant, Tenant};
use tiae_core::models::url_token::UrlTokenPurpose;
use tiae_core::models::user::User;
use tiae_db::store::tenant;
use tracing::info;
use uuid::Uuid;

use crate::control::{Call, ControlPlane};

impl ControlPlane {
    /// Create a tenant with its first user and invite that user. The
    /// invite, the tenant credentials and the proxy entry all go out after
    /// commit.
    pub async fn add_tenant(&self, call: &Call, input: CreateTenant) -> TiaeResult<(Tenant, User)> {
        call.require_admin()?;
        let mut ctx = self.begin(call);
        let result = async {
            let (tenant, first_user) =
                tenant::add_tenant(&mut ctx, input, self.auth.effective_bcrypt_cost()).await?;
            self.stage_user_email(&mut ctx, &tenant, &first_user, UrlTokenPurpose::Signup)
                .await?;
            Ok((tenant, first_user))
        }
        .await;
        let (tenant, first_user) = self.finish(ctx, result).await?;
        info!(tenant = %tenant.short_name, tenant_id = %tenant.id, "Tenant created");
        Ok((tenant, first_user))
    }

    pub async fn get_tenant_by_short_name(&self, call: &Call, short_name: &str) -> TiaeResult<Tenant> {
        let mut ctx = self.begin(call);
        let result = self.scope_tenant(&mut ctx, call, short_name).await;
        self.finish(ctx, result).await
    }

    pub async fn get_tenant_by_id(&self, call: &Call, id: Uuid) -> TiaeResult<Tenant> {
        call.require_admin()?;
        let mut ctx = self.begin(call);
        let result = tenant::get_tenant_by_id(&mut ctx, id).await;
        self.finish(ctx, result).await
    }

    pub async fn list_tenants(&self, call: &Call) -> TiaeResult<Vec<Tenant>> {
        call.require_admin()?;
        let mut ctx = self.begin(call);
        let result = tenant::list_tenants(&mut ctx).await;
        self.finish(ctx, result).await
    }

    pub async fn set_tenant_enabled(&self, call: &Call, id: Uuid, enabled: bool) -> TiaeResult<Tenant> {
        call.require_admin()?;
        let mut ctx = self.begin(call);
        let result = tenant::set_tenant_enabled(&mut ctx, id, enabled).await;
        self.finish(ctx, result).await
    }

    pub async fn delete_tenant(&self, call: &Call, id: Uuid) -> TiaeResult<Tenant> {
        call.require_admin()?;
        let mut ctx = self.begin(call);
        let result = tenant::delete_tenant(&mut ctx, id).await;
        let deleted = self.finish(ctx, result).await?;
        info!(tenant = %deleted.short_name, "Tenant deleted");
        Ok(deleted)
    }
}
