use tiae_auth::{AuthError, password};
use tiae_core::caller::PrincipalKind;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::session::IssuedSession;
use tiae_db::TxContext;
use tiae_db::store::{admin, session, tenant, user};
use tracing::{info, warn};
use uuid::Uuid;

use crate::control::{Call, ControlPlane};

/// Wrong tenant, unknown email and bad password all look the same.
fn bad_credentials() -> TiaeError {
    AuthError::InvalidCredentials.into()
}

impl ControlPlane {
    /// Log a tenant user in.
    ///
    /// Only a correct password reveals that an account is disabled.
    pub async fn login(
        &self,
        call: &Call,
        tenant_short_name: &str,
        email: &str,
        password: &str,
    ) -> TiaeResult<IssuedSession> {
        let mut ctx = self.begin(call);
        let result = self.login_in(&mut ctx, tenant_short_name, email, password).await;
        if let Err(err) = &result {
            info!(tenant = tenant_short_name, error = %err, "Login refused");
        }
        self.finish(ctx, result).await
    }

    async fn login_in(
        &self,
        ctx: &mut TxContext,
        tenant_short_name: &str,
        email: &str,
        password: &str,
    ) -> TiaeResult<IssuedSession> {
        match tenant::attach(ctx, tenant_short_name).await {
            Ok(_) => {}
            Err(TiaeError::NotFound { .. } | TiaeError::InvalidShortName(_)) => {
                return Err(bad_credentials());
            }
            Err(err) => return Err(err),
        }
        let Some(found) = user::find_user_by_email(ctx, email).await? else {
            return Err(bad_credentials());
        };
        let Some(hash) = found.password_hash.as_deref() else {
            return Err(bad_credentials());
        };
        if !password::verify_password(password, hash)? {
            return Err(bad_credentials());
        }
        let issued = session::create_session(ctx, &found, &self.auth).await?;
        ctx.attach_principal(PrincipalKind::User, found.id, found.email.clone());
        info!(
            tenant = tenant_short_name,
            user_id = %found.id,
            session_id = %issued.session_id,
            "User logged in"
        );
        Ok(issued)
    }

    pub async fn admin_login(&self, call: &Call, email: &str, password: &str) -> TiaeResult<IssuedSession> {
        let mut ctx = self.begin(call);
        let result = async {
            let Some(found) = admin::find_admin_by_email(&mut ctx, email).await? else {
                return Err(bad_credentials());
            };
            let Some(hash) = found.password_hash.as_deref() else {
                return Err(bad_credentials());
            };
            if !password::verify_password(password, hash)? {
                return Err(bad_credentials());
            }
            let issued = session::create_admin_session(&mut ctx, &found, &self.auth).await?;
            info!(admin_id = %found.id, session_id = %issued.session_id, "Admin logged in");
            Ok(issued)
        }
        .await;
        if let Err(err) = &result {
            info!(error = %err, "Admin login refused");
        }
        self.finish(ctx, result).await
    }

    /// Trade a refresh token for a new session. The old session ends.
    ///
    /// Works on a session that has already expired, so it does not rely
    /// on the interceptor.
    pub async fn refresh_session(
        &self,
        call: &Call,
        session_id: Uuid,
        refresh_token: &str,
    ) -> TiaeResult<IssuedSession> {
        let mut ctx = self.begin(call);
        let result = session::refresh_session(&mut ctx, session_id, refresh_token, &self.auth).await;
        self.finish(ctx, result).await
    }

    pub async fn refresh_admin_session(
        &self,
        call: &Call,
        session_id: Uuid,
        refresh_token: &str,
    ) -> TiaeResult<IssuedSession> {
        let mut ctx = self.begin(call);
        let result =
            session::refresh_admin_session(&mut ctx, session_id, refresh_token, &self.auth).await;
        self.finish(ctx, result).await
    }

    /// End the caller's own session.
    pub async fn logout(&self, call: &Call) -> TiaeResult<()> {
        let auth = call.require_auth()?.clone();
        let mut ctx = self.begin(call);
        let result = async {
            if auth.is_admin() {
                session::admin_logout(&mut ctx, auth.session_id).await
            } else {
                let short_name = auth.tenant_short_name.as_deref().ok_or_else(|| {
                    TiaeError::Unauthenticated("session has no tenant".into())
                })?;
                tenant::attach(&mut ctx, short_name).await?;
                session::logout(&mut ctx, auth.session_id).await
            }
        }
        .await;
        self.finish(ctx, result).await?;
        info!(session_id = %auth.session_id, principal = %auth.principal.kind, "Logged out");
        Ok(())
    }

    /// Change the caller's password. Every earlier session, including the
    /// current one, ends; the returned session replaces it.
    pub async fn change_password(
        &self,
        call: &Call,
        old_password: &str,
        new_password: &str,
    ) -> TiaeResult<IssuedSession> {
        let auth = call.require_auth()?.clone();
        if auth.is_admin() {
            return Err(TiaeError::PermissionDenied(
                "admins change passwords through a reset link".into(),
            ));
        }
        password::check_policy(new_password, self.auth.min_password_length)?;
        let short_name = auth
            .tenant_short_name
            .clone()
            .ok_or_else(|| TiaeError::Unauthenticated("session has no tenant".into()))?;

        let mut ctx = self.begin(call);
        let result = async {
            tenant::attach(&mut ctx, &short_name).await?;
            let current = user::get_user_by_id(&mut ctx, auth.principal.id).await?;
            let verified = match current.password_hash.as_deref() {
                Some(hash) => password::verify_password(old_password, hash)?,
                None => false,
            };
            if !verified {
                return Err(bad_credentials());
            }
            user::set_user_password(
                &mut ctx,
                current.id,
                new_password,
                self.auth.effective_bcrypt_cost(),
            )
            .await?;
            let refreshed = user::get_user_by_id(&mut ctx, current.id).await?;
            session::create_session(&mut ctx, &refreshed, &self.auth).await
        }
        .await;
        let issued = self.finish(ctx, result).await?;
        info!(tenant = %short_name, user_id = %auth.principal.id, "Password changed");
        Ok(issued)
    }

    /// Move timed-out sessions to `expired` in the global catalog and in
    /// every live tenant. A failing tenant is logged and skipped.
    pub async fn expire_stale_sessions(&self) -> TiaeResult<u64> {
        let call = Call::anonymous();
        let mut ctx = self.begin(&call);
        let result = session::expire_stale_sessions(&mut ctx).await;
        let mut total = self.finish(ctx, result).await?;

        for short_name in tenant::live_short_names(self.registry.get_db()).await? {
            let mut ctx = self.begin(&call);
            let result = async {
                tenant::attach(&mut ctx, &short_name).await?;
                session::expire_stale_sessions(&mut ctx).await
            }
            .await;
            match self.finish(ctx, result).await {
                Ok(expired) => total += expired,
                Err(err) => warn!(tenant = %short_name, error = %err, "Session sweep failed"),
            }
        }
        if total > 0 {
            info!(expired = total, "Stale sessions expired");
        }
        Ok(total)
    }
}
