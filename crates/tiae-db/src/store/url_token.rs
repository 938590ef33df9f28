//! One-shot URL tokens behind email links.
//!
//! Tenant tokens live in the tenant schema and point at a user; admin
//! tokens live in the global catalog and point at an admin. A token is
//! consumed at most once: the consuming UPDATE only matches rows that are
//! still unconsumed and unexpired.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use tiae_auth::AuthConfig;
use tiae_auth::error::AuthError;
use tiae_auth::token::{self, EnvelopeClaims};
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::url_token::{UrlToken, UrlTokenPurpose, UrlTokenScope, UrlTokenStatus};
use uuid::Uuid;

use crate::context::TxContext;
use crate::error::db_err;
use crate::store::{parse_column, tenant};

#[derive(Debug, FromRow)]
struct UrlTokenRow {
    id: Uuid,
    owner_id: Uuid,
    purpose: String,
    expires_at: DateTime<Utc>,
    consumed: bool,
    created_at: DateTime<Utc>,
}

impl UrlTokenRow {
    fn try_into_token(self) -> TiaeResult<UrlToken> {
        Ok(UrlToken {
            id: self.id,
            owner_id: self.owner_id,
            purpose: parse_column("url_tokens.purpose", &self.purpose)?,
            expires_at: self.expires_at,
            consumed: self.consumed,
            created_at: self.created_at,
        })
    }
}

fn table(scope: UrlTokenScope) -> (&'static str, &'static str) {
    match scope {
        UrlTokenScope::Tenant => ("url_tokens", "user_id"),
        UrlTokenScope::Admin => ("admin_url_tokens", "admin_id"),
    }
}

/// Persist a new unconsumed token and return it with its signed envelope.
pub async fn create_url_token(
    ctx: &mut TxContext,
    config: &AuthConfig,
    scope: UrlTokenScope,
    owner_id: Uuid,
    purpose: UrlTokenPurpose,
    ttl: Duration,
) -> TiaeResult<(UrlToken, String)> {
    let (table, owner) = table(scope);
    let sql = format!(
        "INSERT INTO {table} (id, {owner}, purpose, expires_at, consumed) \
         VALUES ($1, $2, $3, $4, FALSE) \
         RETURNING id, {owner} AS owner_id, purpose, expires_at, consumed, created_at"
    );
    let expires_at = Utc::now() + ttl;

    let (envelope_tenant, conn) = match scope {
        UrlTokenScope::Tenant => {
            let tenant_id = ctx.require_tenant()?.id;
            (tenant_id, ctx.tenant_tx().await?)
        }
        UrlTokenScope::Admin => (Uuid::nil(), ctx.main_tx().await?),
    };

    let row = sqlx::query_as::<_, UrlTokenRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(purpose.as_str())
        .bind(expires_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err)?;
    let url_token = row.try_into_token()?;

    let envelope = token::issue_envelope(
        envelope_tenant,
        url_token.id,
        purpose,
        url_token.expires_at,
        config,
    )?;
    Ok((url_token, envelope))
}

pub async fn get_url_token(
    ctx: &mut TxContext,
    scope: UrlTokenScope,
    id: Uuid,
) -> TiaeResult<UrlToken> {
    let (table, owner) = table(scope);
    let sql = format!(
        "SELECT id, {owner} AS owner_id, purpose, expires_at, consumed, created_at \
         FROM {table} WHERE id = $1"
    );
    let conn = match scope {
        UrlTokenScope::Tenant => ctx.tenant_tx().await?,
        UrlTokenScope::Admin => ctx.main_tx().await?,
    };
    sqlx::query_as::<_, UrlTokenRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| TiaeError::not_found("url token", id))?
        .try_into_token()
}

/// `Valid` only while unconsumed and `now < expires_at`.
pub fn validate_url_token(token: &UrlToken) -> UrlTokenStatus {
    token.status_at(Utc::now())
}

/// Mark a token consumed. Exactly one caller can win; everyone else gets
/// `AlreadyConsumed` (or `Expired` when the deadline passed first).
pub async fn consume_url_token(
    ctx: &mut TxContext,
    scope: UrlTokenScope,
    id: Uuid,
) -> TiaeResult<()> {
    let (table, _) = table(scope);
    let sql = format!(
        "UPDATE {table} SET consumed = TRUE \
         WHERE id = $1 AND consumed = FALSE AND expires_at > now()"
    );
    let conn = match scope {
        UrlTokenScope::Tenant => ctx.tenant_tx().await?,
        UrlTokenScope::Admin => ctx.main_tx().await?,
    };
    let updated = sqlx::query(&sql)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?
        .rows_affected();
    if updated == 1 {
        return Ok(());
    }

    let current = get_url_token(ctx, scope, id).await?;
    match validate_url_token(&current) {
        UrlTokenStatus::Consumed => Err(TiaeError::AlreadyConsumed),
        UrlTokenStatus::Expired => Err(TiaeError::Expired),
        UrlTokenStatus::Valid => Err(TiaeError::Conflict(
            "url token changed concurrently".into(),
        )),
    }
}

/// Verify an envelope and load the URL token it points at, attaching the
/// tenant for tenant tokens. Nothing is consumed.
pub async fn resolve_envelope(
    ctx: &mut TxContext,
    config: &AuthConfig,
    envelope: &str,
    accepted: &[UrlTokenPurpose],
) -> TiaeResult<(EnvelopeClaims, UrlToken)> {
    let claims = token::verify_envelope(envelope, config).map_err(AuthError::from)?;

    let scope = if claims.is_admin() {
        UrlTokenScope::Admin
    } else {
        match ctx.tenant() {
            Some(t) if t.id == claims.tid => {}
            Some(_) => return Err(TiaeError::InvalidToken("token belongs to another tenant".into())),
            None => {
                tenant::attach_by_id(ctx, claims.tid)
                    .await
                    .map_err(|e| match e {
                        TiaeError::NotFound { .. } => {
                            TiaeError::InvalidToken("unknown tenant".into())
                        }
                        other => other,
                    })?;
            }
        }
        UrlTokenScope::Tenant
    };

    let url_token = get_url_token(ctx, scope, claims.uid)
        .await
        .map_err(|e| match e {
            TiaeError::NotFound { .. } => TiaeError::InvalidToken("unknown url token".into()),
            other => other,
        })?;
    if url_token.purpose != claims.purpose {
        return Err(TiaeError::InvalidToken("purpose mismatch".into()));
    }
    url_token.ensure_redeemable(Utc::now(), accepted)?;
    Ok((claims, url_token))
}
