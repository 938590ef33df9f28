use chrono::Duration;
use serde::Serialize;
use tiae_auth::password;
use tiae_core::caller::PrincipalKind;
use tiae_core::effects::PostCommit;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::admin::Admin;
use tiae_core::models::session::IssuedSession;
use tiae_core::models::tenant::Tenant;
use tiae_core::models::url_token::{UrlToken, UrlTokenPurpose, UrlTokenScope};
use tiae_core::models::user::User;
use tiae_db::TxContext;
use tiae_db::store::{admin, email_template, session, url_token, user};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::{Call, ControlPlane};

/// Company name shown in admin emails.
const ADMIN_COMPANY: &str = "the storage console";

/// Longest link lifetime accepted from configuration.
const MAX_LINK_TTL_SECS: u64 = 365 * 24 * 3600;

/// What the console shows before a link is redeemed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InviteInfo {
    pub email: String,
    pub company: String,
    pub purpose: UrlTokenPurpose,
}

impl ControlPlane {
    fn link_ttl(&self) -> Duration {
        let secs = self.auth.url_token_lifetime_secs.min(MAX_LINK_TTL_SECS);
        Duration::try_seconds(secs as i64).unwrap_or_else(|| Duration::hours(72))
    }

    /// Create a URL token for `recipient`, render the tenant's template
    /// for `purpose` and stage the message for after commit.
    pub(crate) async fn stage_user_email(
        &self,
        ctx: &mut TxContext,
        tenant: &Tenant,
        recipient: &User,
        purpose: UrlTokenPurpose,
    ) -> TiaeResult<UrlToken> {
        let (token, envelope) = url_token::create_url_token(
            ctx,
            &self.auth,
            UrlTokenScope::Tenant,
            recipient.id,
            purpose,
            self.link_ttl(),
        )
        .await?;
        let template = email_template::get_template(ctx, purpose).await?;
        let link = self.mailer.link(purpose, &envelope);
        let email = self
            .mailer
            .render(&template, &recipient.email, &tenant.name, &link)?;
        ctx.after_commit(PostCommit::SendEmail(email));
        debug!(tenant = %tenant.short_name, user_id = %recipient.id, %purpose, "Email staged");
        Ok(token)
    }

    /// Send a signup, reset or forgot email to a user of `tenant`.
    pub async fn send_email_to_user(
        &self,
        call: &Call,
        tenant: &str,
        purpose: UrlTokenPurpose,
        user_id: Uuid,
    ) -> TiaeResult<()> {
        let mut ctx = self.begin(call);
        let result = async {
            let scoped = self.scope_tenant(&mut ctx, call, tenant).await?;
            let recipient = user::get_user_by_id(&mut ctx, user_id).await?;
            self.stage_user_email(&mut ctx, &scoped, &recipient, purpose)
                .await?;
            Ok(())
        }
        .await;
        self.finish(ctx, result).await
    }

    /// Describe a tenant link without consuming it.
    pub async fn validate_invite(&self, call: &Call, envelope: &str) -> TiaeResult<InviteInfo> {
        let mut ctx = self.begin(call);
        let result = async {
            let (claims, token) = url_token::resolve_envelope(
                &mut ctx,
                &self.auth,
                envelope,
                &[
                    UrlTokenPurpose::Signup,
                    UrlTokenPurpose::Reset,
                    UrlTokenPurpose::Forgot,
                ],
            )
            .await?;
            if claims.is_admin() {
                return Err(TiaeError::InvalidToken("not a tenant link".into()));
            }
            let company = ctx.require_tenant()?.name.clone();
            let owner = user::get_user_by_id(&mut ctx, token.owner_id).await?;
            Ok(InviteInfo {
                email: owner.email,
                company,
                purpose: token.purpose,
            })
        }
        .await;
        self.finish(ctx, result).await
    }

    /// Redeem a signup link: set the password, enable the user, consume
    /// the token and open the first session.
    pub async fn complete_signup(
        &self,
        call: &Call,
        envelope: &str,
        new_password: &str,
    ) -> TiaeResult<IssuedSession> {
        password::check_policy(new_password, self.auth.min_password_length)?;
        let mut ctx = self.begin(call);
        let result = async {
            let (claims, token) = url_token::resolve_envelope(
                &mut ctx,
                &self.auth,
                envelope,
                &[UrlTokenPurpose::Signup],
            )
            .await?;
            if claims.is_admin() {
                return Err(TiaeError::InvalidToken("not a tenant link".into()));
            }
            let activated = user::activate_with_password(
                &mut ctx,
                token.owner_id,
                new_password,
                self.auth.effective_bcrypt_cost(),
            )
            .await?;
            url_token::consume_url_token(&mut ctx, UrlTokenScope::Tenant, token.id).await?;
            ctx.attach_principal(PrincipalKind::User, activated.id, activated.email.clone());
            let issued = session::create_session(&mut ctx, &activated, &self.auth).await?;
            info!(user_id = %activated.id, "Signup completed");
            Ok(issued)
        }
        .await;
        self.finish(ctx, result).await
    }

    /// Redeem a reset or forgot link. Every session of the user ends.
    pub async fn reset_password(
        &self,
        call: &Call,
        envelope: &str,
        new_password: &str,
    ) -> TiaeResult<()> {
        password::check_policy(new_password, self.auth.min_password_length)?;
        let mut ctx = self.begin(call);
        let result = async {
            let (claims, token) = url_token::resolve_envelope(
                &mut ctx,
                &self.auth,
                envelope,
                &[UrlTokenPurpose::Reset, UrlTokenPurpose::Forgot],
            )
            .await?;
            if claims.is_admin() {
                return Err(TiaeError::InvalidToken("not a tenant link".into()));
            }
            user::set_user_password(
                &mut ctx,
                token.owner_id,
                new_password,
                self.auth.effective_bcrypt_cost(),
            )
            .await?;
            url_token::consume_url_token(&mut ctx, UrlTokenScope::Tenant, token.id).await?;
            info!(user_id = %token.owner_id, "Password reset");
            Ok(())
        }
        .await;
        self.finish(ctx, result).await
    }

    /// The public `SetPassword` method: a signup link yields a session, a
    /// reset or forgot link does not.
    pub async fn set_password(
        &self,
        call: &Call,
        envelope: &str,
        new_password: &str,
    ) -> TiaeResult<Option<IssuedSession>> {
        let claims = tiae_auth::token::verify_envelope(envelope, &self.auth)
            .map_err(tiae_auth::AuthError::from)?;
        match claims.purpose {
            UrlTokenPurpose::Signup => self
                .complete_signup(call, envelope, new_password)
                .await
                .map(Some),
            UrlTokenPurpose::Reset | UrlTokenPurpose::Forgot => {
                self.reset_password(call, envelope, new_password).await?;
                Ok(None)
            }
        }
    }

    /// Start password recovery. Succeeds whether or not the account
    /// exists; only the log tells the difference.
    pub async fn forgot_password(&self, call: &Call, tenant: &str, email: &str) -> TiaeResult<()> {
        let mut ctx = self.begin(call);
        let result = async {
            let scoped = match tiae_db::store::tenant::attach(&mut ctx, tenant).await {
                Ok(t) => t,
                Err(TiaeError::NotFound { .. } | TiaeError::InvalidShortName(_)) => {
                    return Ok(false);
                }
                Err(err) => return Err(err),
            };
            let Some(recipient) = user::find_user_by_email(&mut ctx, email).await? else {
                return Ok(false);
            };
            self.stage_user_email(&mut ctx, &scoped, &recipient, UrlTokenPurpose::Forgot)
                .await?;
            Ok(true)
        }
        .await;
        match self.finish(ctx, result).await {
            Ok(true) => info!(%tenant, "Recovery email queued"),
            Ok(false) => debug!(%tenant, "Recovery requested for unknown account"),
            Err(err) => warn!(%tenant, error = %err, "Recovery request failed"),
        }
        Ok(())
    }

    /// Create an admin and email a signup link to set the password.
    pub async fn invite_admin(&self, call: &Call, name: &str, email: &str) -> TiaeResult<Admin> {
        call.require_admin()?;
        let mut ctx = self.begin(call);
        let result = self.invite_admin_in(&mut ctx, name, email).await;
        self.finish(ctx, result).await
    }

    pub(crate) async fn invite_admin_in(
        &self,
        ctx: &mut TxContext,
        name: &str,
        email: &str,
    ) -> TiaeResult<Admin> {
        let invited = admin::add_admin(ctx, name, email).await?;
        let (_, envelope) = url_token::create_url_token(
            ctx,
            &self.auth,
            UrlTokenScope::Admin,
            invited.id,
            UrlTokenPurpose::Signup,
            self.link_ttl(),
        )
        .await?;
        let link = self.mailer.link(UrlTokenPurpose::Signup, &envelope);
        let message = self.mailer.render(
            &email_template::default_template(UrlTokenPurpose::Signup),
            &invited.email,
            ADMIN_COMPANY,
            &link,
        )?;
        ctx.after_commit(PostCommit::SendEmail(message));
        info!(admin_id = %invited.id, "Admin invited");
        Ok(invited)
    }

    /// The admin `ValidateToken` method: describe an admin link without
    /// consuming it.
    pub async fn validate_token(&self, call: &Call, envelope: &str) -> TiaeResult<InviteInfo> {
        let mut ctx = self.begin(call);
        let result = async {
            let (claims, token) = url_token::resolve_envelope(
                &mut ctx,
                &self.auth,
                envelope,
                &[UrlTokenPurpose::Signup, UrlTokenPurpose::Reset],
            )
            .await?;
            if !claims.is_admin() {
                return Err(TiaeError::InvalidToken("not an admin link".into()));
            }
            let owner = admin::get_admin_by_id(&mut ctx, token.owner_id).await?;
            Ok(InviteInfo {
                email: owner.email,
                company: ADMIN_COMPANY.into(),
                purpose: token.purpose,
            })
        }
        .await;
        self.finish(ctx, result).await
    }

    /// The admin `SetPassword` method.
    pub async fn set_admin_password(
        &self,
        call: &Call,
        envelope: &str,
        new_password: &str,
    ) -> TiaeResult<Admin> {
        password::check_policy(new_password, self.auth.min_password_length)?;
        let mut ctx = self.begin(call);
        let result = async {
            let (claims, token) = url_token::resolve_envelope(
                &mut ctx,
                &self.auth,
                envelope,
                &[UrlTokenPurpose::Signup, UrlTokenPurpose::Reset],
            )
            .await?;
            if !claims.is_admin() {
                return Err(TiaeError::InvalidToken("not an admin link".into()));
            }
            admin::set_admin_password(
                &mut ctx,
                token.id,
                new_password,
                self.auth.effective_bcrypt_cost(),
            )
            .await
        }
        .await;
        let updated = self.finish(ctx, result).await?;
        info!(admin_id = %updated.id, "Admin password set");
        Ok(updated)
    }
}
