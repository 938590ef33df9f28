//! Session manager.
//!
//! Tenant sessions live in the tenant schema; a row in the global
//! `session_routes` table maps each session id to its tenant so a bare
//! token can be resolved. Admin sessions live in the global catalog.
//! Status only moves `valid → invalid` or `valid → expired`; every UPDATE
//! here is guarded on `status = 'valid'`.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use tiae_auth::AuthConfig;
use tiae_auth::error::AuthError;
use tiae_auth::token;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::admin::Admin;
use tiae_core::models::session::{AdminSession, IssuedSession, Session, SessionStatus};
use tiae_core::models::user::User;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::TxContext;
use crate::error::db_err;
use crate::store::{admin, parse_column, tenant, user};

#[derive(Debug, FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    tenant_id: Uuid,
    refresh_token_hash: String,
    status: String,
    expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = TiaeError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Session {
            id: row.id,
            user_id: row.user_id,
            tenant_id: row.tenant_id,
            status: parse_column("sessions.status", &row.status)?,
            expires_at: row.expires_at,
            refresh_expires_at: row.refresh_expires_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AdminSessionRow {
    id: Uuid,
    admin_id: Uuid,
    refresh_token_hash: String,
    status: String,
    expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AdminSessionRow> for AdminSession {
    type Error = TiaeError;

    fn try_from(row: AdminSessionRow) -> Result<Self, Self::Error> {
        Ok(AdminSession {
            id: row.id,
            admin_id: row.admin_id,
            status: parse_column("admin_sessions.status", &row.status)?,
            expires_at: row.expires_at,
            refresh_expires_at: row.refresh_expires_at,
            created_at: row.created_at,
        })
    }
}

const SESSION_COLUMNS: &str =
    "id, user_id, tenant_id, refresh_token_hash, status, expires_at, refresh_expires_at, created_at";
const ADMIN_SESSION_COLUMNS: &str =
    "id, admin_id, refresh_token_hash, status, expires_at, refresh_expires_at, created_at";

/// Generic refusal for every refresh failure.
fn bad_refresh() -> TiaeError {
    TiaeError::Unauthenticated("invalid or expired refresh token".into())
}

fn deadline(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let lifetime = i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX);
    now.checked_add_signed(lifetime)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct Deadlines {
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
}

fn deadlines(config: &AuthConfig) -> Deadlines {
    let now = Utc::now();
    Deadlines {
        now,
        expires_at: deadline(now, config.session_lifetime_secs),
        refresh_expires_at: deadline(now, config.refresh_lifetime_secs),
    }
}

/// Reject transitions other than `valid → invalid` and `valid → expired`.
fn check_target(status: SessionStatus) -> TiaeResult<()> {
    if SessionStatus::Valid.can_transition_to(status) {
        Ok(())
    } else {
        Err(TiaeError::InvalidArgument(format!(
            "sessions cannot move to {status}"
        )))
    }
}

/// Open a session for `user` in the attached tenant. Refuses disabled
/// users and tenants. Visible to other requests once the context commits.
pub async fn create_session(
    ctx: &mut TxContext,
    user: &User,
    config: &AuthConfig,
) -> TiaeResult<IssuedSession> {
    let tenant = ctx.require_tenant()?.clone();
    if user.tenant_id != tenant.id {
        return Err(TiaeError::PermissionDenied(
            "user belongs to another tenant".into(),
        ));
    }
    if !tenant.enabled || !user.enabled {
        return Err(AuthError::AccountDisabled.into());
    }

    let id = token::generate_session_token();
    let refresh_token = token::generate_refresh_token();
    let d = deadlines(config);

    // Route first: global before tenant.
    let conn = ctx.main_tx().await?;
    sqlx::query("INSERT INTO session_routes (session_id, tenant_id) VALUES ($1, $2)")
        .bind(id)
        .bind(tenant.id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    let conn = ctx.tenant_tx().await?;
    sqlx::query(
        "INSERT INTO sessions \
         (id, user_id, tenant_id, refresh_token_hash, status, expires_at, refresh_expires_at, created_at) \
         VALUES ($1, $2, $3, $4, 'valid', $5, $6, $7)",
    )
    .bind(id)
    .bind(user.id)
    .bind(tenant.id)
    .bind(token::hash_refresh_token(&refresh_token))
    .bind(d.expires_at)
    .bind(d.refresh_expires_at)
    .bind(d.now)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    debug!(tenant = %tenant.short_name, user_id = %user.id, session_id = %id, "Session created");
    Ok(IssuedSession {
        session_id: id,
        refresh_token,
        expires_at: d.expires_at,
        refresh_expires_at: d.refresh_expires_at,
    })
}

pub async fn create_admin_session(
    ctx: &mut TxContext,
    admin: &Admin,
    config: &AuthConfig,
) -> TiaeResult<IssuedSession> {
    let id = token::generate_session_token();
    let refresh_token = token::generate_refresh_token();
    let d = deadlines(config);

    let conn = ctx.main_tx().await?;
    sqlx::query(
        "INSERT INTO admin_sessions \
         (id, admin_id, refresh_token_hash, status, expires_at, refresh_expires_at, created_at) \
         VALUES ($1, $2, $3, 'valid', $4, $5, $6)",
    )
    .bind(id)
    .bind(admin.id)
    .bind(token::hash_refresh_token(&refresh_token))
    .bind(d.expires_at)
    .bind(d.refresh_expires_at)
    .bind(d.now)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    debug!(admin_id = %admin.id, session_id = %id, "Admin session created");
    Ok(IssuedSession {
        session_id: id,
        refresh_token,
        expires_at: d.expires_at,
        refresh_expires_at: d.refresh_expires_at,
    })
}

/// Find the tenant that owns `session_id` and attach it. `false` when the
/// route is unknown, the tenant is gone or disabled, or the context is
/// already bound to a different tenant.
async fn attach_session_tenant(ctx: &mut TxContext, session_id: Uuid) -> TiaeResult<bool> {
    let conn = ctx.main_tx().await?;
    let tenant_id: Option<Uuid> =
        sqlx::query_scalar("SELECT tenant_id FROM session_routes WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
    let Some(tenant_id) = tenant_id else {
        return Ok(false);
    };

    match ctx.tenant() {
        Some(t) => Ok(t.id == tenant_id && t.enabled),
        None => match tenant::attach_by_id(ctx, tenant_id).await {
            Ok(t) => Ok(t.enabled),
            Err(TiaeError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        },
    }
}

async fn load_session(ctx: &mut TxContext, session_id: Uuid, lock: bool) -> TiaeResult<Option<SessionRow>> {
    let suffix = if lock { " FOR UPDATE" } else { "" };
    let conn = ctx.tenant_tx().await?;
    sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1{suffix}"
    ))
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)
}

async fn load_admin_session(
    ctx: &mut TxContext,
    session_id: Uuid,
    lock: bool,
) -> TiaeResult<Option<AdminSessionRow>> {
    let suffix = if lock { " FOR UPDATE" } else { "" };
    let conn = ctx.main_tx().await?;
    sqlx::query_as::<_, AdminSessionRow>(&format!(
        "SELECT {ADMIN_SESSION_COLUMNS} FROM admin_sessions WHERE id = $1{suffix}"
    ))
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)
}

/// A usable session for `session_id`, attaching its tenant. A session past
/// its deadline is moved to `expired` on the way out.
pub async fn get_valid_session(ctx: &mut TxContext, session_id: Uuid) -> TiaeResult<Option<Session>> {
    if !attach_session_tenant(ctx, session_id).await? {
        return Ok(None);
    }
    let Some(row) = load_session(ctx, session_id, false).await? else {
        return Ok(None);
    };
    let session = Session::try_from(row)?;
    let now = Utc::now();
    if session.is_usable_at(now) {
        return Ok(Some(session));
    }
    if session.status == SessionStatus::Valid {
        expire_session(ctx, session_id).await?;
    }
    Ok(None)
}

async fn expire_session(ctx: &mut TxContext, session_id: Uuid) -> TiaeResult<()> {
    let conn = ctx.tenant_tx().await?;
    sqlx::query("UPDATE sessions SET status = 'expired' WHERE id = $1 AND status = 'valid'")
        .bind(session_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    debug!(session_id = %session_id, "Session expired");
    Ok(())
}

pub async fn get_valid_admin_session(
    ctx: &mut TxContext,
    session_id: Uuid,
) -> TiaeResult<Option<AdminSession>> {
    let Some(row) = load_admin_session(ctx, session_id, false).await? else {
        return Ok(None);
    };
    let session = AdminSession::try_from(row)?;
    if session.is_usable_at(Utc::now()) {
        return Ok(Some(session));
    }
    if session.status == SessionStatus::Valid {
        let conn = ctx.main_tx().await?;
        sqlx::query(
            "UPDATE admin_sessions SET status = 'expired' WHERE id = $1 AND status = 'valid'",
        )
        .bind(session_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }
    Ok(None)
}

/// Move one tenant session out of `valid`. Fails with `Conflict` when the
/// session already left `valid`.
pub async fn update_session_status(
    ctx: &mut TxContext,
    session_id: Uuid,
    status: SessionStatus,
) -> TiaeResult<()> {
    check_target(status)?;
    let conn = ctx.tenant_tx().await?;
    let current: Option<String> = sqlx::query_scalar(
        "UPDATE sessions SET status = $2 WHERE id = $1 AND status = 'valid' RETURNING status",
    )
    .bind(session_id)
    .bind(status.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    if current.is_some() {
        return Ok(());
    }

    match load_session(ctx, session_id, false).await? {
        None => Err(TiaeError::not_found("session", session_id)),
        Some(row) => Err(TiaeError::Conflict(format!(
            "session is already {}",
            row.status
        ))),
    }
}

/// Move many tenant sessions out of `valid` in one statement. Sessions that
/// are no longer valid are left alone. Returns the number changed.
pub async fn update_bulk_session_status(
    ctx: &mut TxContext,
    session_ids: &[Uuid],
    status: SessionStatus,
) -> TiaeResult<u64> {
    check_target(status)?;
    if session_ids.is_empty() {
        return Ok(0);
    }
    let conn = ctx.tenant_tx().await?;
    let changed = sqlx::query(
        "UPDATE sessions SET status = $2 WHERE id = ANY($1) AND status = 'valid'",
    )
    .bind(session_ids)
    .bind(status.as_str())
    .execute(&mut *conn)
    .await
    .map_err(db_err)?
    .rows_affected();
    Ok(changed)
}

/// Trade a refresh token for a new session. The old session is
/// invalidated; the user must still be enabled.
pub async fn refresh_session(
    ctx: &mut TxContext,
    session_id: Uuid,
    refresh_token: &str,
    config: &AuthConfig,
) -> TiaeResult<IssuedSession> {
    if !attach_session_tenant(ctx, session_id).await? {
        return Err(bad_refresh());
    }
    let row = load_session(ctx, session_id, true)
        .await?
        .ok_or_else(bad_refresh)?;
    if row.refresh_token_hash != token::hash_refresh_token(refresh_token) {
        return Err(bad_refresh());
    }
    let session = Session::try_from(row)?;
    if session.status == SessionStatus::Invalid || Utc::now() >= session.refresh_expires_at {
        return Err(bad_refresh());
    }

    let conn = ctx.tenant_tx().await?;
    sqlx::query("UPDATE sessions SET status = 'invalid' WHERE id = $1 AND status = 'valid'")
        .bind(session_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    let user = user::get_user_by_id(ctx, session.user_id)
        .await
        .map_err(|e| match e {
            TiaeError::NotFound { .. } => bad_refresh(),
            other => other,
        })?;
    let issued = create_session(ctx, &user, config).await?;
    info!(user_id = %user.id, session_id = %issued.session_id, "Session refreshed");
    Ok(issued)
}

pub async fn refresh_admin_session(
    ctx: &mut TxContext,
    session_id: Uuid,
    refresh_token: &str,
    config: &AuthConfig,
) -> TiaeResult<IssuedSession> {
    let row = load_admin_session(ctx, session_id, true)
        .await?
        .ok_or_else(bad_refresh)?;
    if row.refresh_token_hash != token::hash_refresh_token(refresh_token) {
        return Err(bad_refresh());
    }
    let session = AdminSession::try_from(row)?;
    if session.status == SessionStatus::Invalid || Utc::now() >= session.refresh_expires_at {
        return Err(bad_refresh());
    }

    let conn = ctx.main_tx().await?;
    sqlx::query("UPDATE admin_sessions SET status = 'invalid' WHERE id = $1 AND status = 'valid'")
        .bind(session_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    let admin = admin::get_admin_by_id(ctx, session.admin_id)
        .await
        .map_err(|e| match e {
            TiaeError::NotFound { .. } => bad_refresh(),
            other => other,
        })?;
    create_admin_session(ctx, &admin, config).await
}

/// Invalidate a tenant session. Logging out twice is not an error.
pub async fn logout(ctx: &mut TxContext, session_id: Uuid) -> TiaeResult<()> {
    let conn = ctx.tenant_tx().await?;
    sqlx::query("UPDATE sessions SET status = 'invalid' WHERE id = $1 AND status = 'valid'")
        .bind(session_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub async fn admin_logout(ctx: &mut TxContext, session_id: Uuid) -> TiaeResult<()> {
    let conn = ctx.main_tx().await?;
    sqlx::query("UPDATE admin_sessions SET status = 'invalid' WHERE id = $1 AND status = 'valid'")
        .bind(session_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Mark timed-out `valid` sessions as `expired`: admin sessions always,
/// tenant sessions when a tenant is attached.
pub async fn expire_stale_sessions(ctx: &mut TxContext) -> TiaeResult<u64> {
    let conn = ctx.main_tx().await?;
    let mut expired = sqlx::query(
        "UPDATE admin_sessions SET status = 'expired' WHERE status = 'valid' AND expires_at <= now()",
    )
    .execute(&mut *conn)
    .await
    .map_err(db_err)?
    .rows_affected();

    if ctx.tenant().is_some() {
        let conn = ctx.tenant_tx().await?;
        expired += sqlx::query(
            "UPDATE sessions SET status = 'expired' WHERE status = 'valid' AND expires_at <= now()",
        )
        .execute(&mut *conn)
        .await
        .map_err(db_err)?
        .rows_affected();
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_targets_are_accepted() {
        assert!(check_target(SessionStatus::Invalid).is_ok());
        assert!(check_target(SessionStatus::Expired).is_ok());
        assert!(check_target(SessionStatus::Valid).is_err());
    }

    #[test]
    fn deadlines_follow_config() {
        let config = AuthConfig::default();
        let d = deadlines(&config);
        assert_eq!((d.expires_at - d.now).num_minutes(), 45);
        assert_eq!((d.refresh_expires_at - d.now).num_hours(), 24);
    }

    #[test]
    fn huge_lifetimes_saturate() {
        let now = Utc::now();
        assert_eq!(deadline(now, u64::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
