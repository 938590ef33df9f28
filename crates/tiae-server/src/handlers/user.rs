use tiae_auth::password;
use tiae_core::error::TiaeResult;
use tiae_core::models::url_token::UrlTokenPurpose;
use tiae_core::models::user::{CreateUser, User};
use tiae_db::store::user;
use uuid::Uuid;

use crate::control::{Call, ControlPlane};

impl ControlPlane {
    /// Add a user. Without an initial password the user starts disabled
    /// and is sent a signup invite.
    pub async fn add_user(&self, call: &Call, tenant: &str, input: CreateUser) -> TiaeResult<User> {
        if let Some(pw) = &input.password {
            password::check_policy(pw, self.auth.min_password_length)?;
        }
        let invite = input.password.is_none();
        let mut ctx = self.begin(call);
        let result = async {
            let scoped = self.scope_tenant(&mut ctx, call, tenant).await?;
            let added = user::add_user(&mut ctx, input, self.auth.effective_bcrypt_cost()).await?;
            if invite {
                self.stage_user_email(&mut ctx, &scoped, &added, UrlTokenPurpose::Signup)
                    .await?;
            }
            Ok(added)
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn get_user_by_id(&self, call: &Call, tenant: &str, id: Uuid) -> TiaeResult<User> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            user::get_user_by_id(&mut ctx, id).await
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn get_user_by_email(&self, call: &Call, tenant: &str, email: &str) -> TiaeResult<User> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            user::get_user_by_email(&mut ctx, email).await
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn list_users(&self, call: &Call, tenant: &str) -> TiaeResult<Vec<User>> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            user::list_users(&mut ctx).await
        }
        .await;
        self.finish(ctx, result).await
    }

    /// Delete a user; its sessions are invalidated in the same transaction.
    pub async fn delete_user(&self, call: &Call, tenant: &str, id: Uuid) -> TiaeResult<()> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            user::delete_user(&mut ctx, id).await
        }
        .await;
        self.finish(ctx, result).await
    }

    pub async fn set_user_enabled(
        &self,
        call: &Call,
        tenant: &str,
        id: Uuid,
        enabled: bool,
    ) -> TiaeResult<User> {
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            user::set_user_enabled(&mut ctx, id, enabled).await
        }
        .await;
        self.finish(ctx, result).await
    }

    /// Set a user's password on their behalf. Their sessions end.
    pub async fn set_user_password(
        &self,
        call: &Call,
        tenant: &str,
        id: Uuid,
        new_password: &str,
    ) -> TiaeResult<()> {
        password::check_policy(new_password, self.auth.min_password_length)?;
        let mut ctx = self.begin(call);
        let result = async {
            self.scope_tenant(&mut ctx, call, tenant).await?;
            user::set_user_password(&mut ctx, id, new_password, self.auth.effective_bcrypt_cost())
                .await
        }
        .await;
        self.finish(ctx, result).await
    }
}
