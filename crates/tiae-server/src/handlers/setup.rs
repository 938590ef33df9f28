use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::admin::Admin;
use tiae_db::schema;
use tiae_db::store::admin;
use tracing::info;

use crate::control::{Call, ControlPlane};

impl ControlPlane {
    /// The admin `SetupDB` method: migrate the global catalog.
    pub async fn setup_db(&self) -> TiaeResult<()> {
        schema::setup(&self.registry).await?;
        Ok(())
    }

    /// The admin `SetupMigrate` method: migrate every tenant schema.
    pub async fn setup_migrate(&self) -> TiaeResult<Vec<String>> {
        let migrated = schema::setup_migrate(&self.registry).await?;
        info!(tenants = migrated.len(), "Tenant schemas migrated");
        Ok(migrated)
    }

    /// The admin `Setup` method: migrate, then invite the first admin.
    /// Refused once any admin exists.
    pub async fn setup(&self, call: &Call, name: &str, email: &str) -> TiaeResult<Admin> {
        self.setup_db().await?;
        let mut ctx = self.begin(call);
        let result = async {
            if !admin::list_admins(&mut ctx).await?.is_empty() {
                return Err(TiaeError::already_exists("admin"));
            }
            self.invite_admin_in(&mut ctx, name, email).await
        }
        .await;
        let first = self.finish(ctx, result).await?;
        info!(admin_id = %first.id, "Control plane bootstrapped");
        Ok(first)
    }
}
