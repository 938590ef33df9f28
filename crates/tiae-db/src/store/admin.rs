//! Global administrators.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tiae_auth::password;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::admin::Admin;
use tiae_core::models::url_token::{UrlTokenPurpose, UrlTokenScope};
use tiae_core::validation::{normalize_email, require_non_empty};
use tracing::info;
use uuid::Uuid;

use crate::context::TxContext;
use crate::error::{db_err, unique_as};
use crate::store::url_token;

#[derive(Debug, FromRow)]
struct AdminRow {
    id: Uuid,
    name: String,
    email: String,
    password_hash: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AdminRow> for Admin {
    fn from(row: AdminRow) -> Self {
        Admin {
            id: row.id,
            name: row.name,
            email: row.email,
            password_hash: row.password_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const ADMIN_COLUMNS: &str = "id, name, email, password_hash, created_at, updated_at";

/// Insert an admin without a password. Fails with `AlreadyExists` when the
/// email is taken.
pub async fn add_admin(ctx: &mut TxContext, name: &str, email: &str) -> TiaeResult<Admin> {
    require_non_empty("admin name", name)?;
    let email = normalize_email(email)?;
    let conn = ctx.main_tx().await?;
    let row = sqlx::query_as::<_, AdminRow>(&format!(
        "INSERT INTO admins (id, name, email) VALUES ($1, $2, $3) RETURNING {ADMIN_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(name.trim())
    .bind(&email)
    .fetch_one(&mut *conn)
    .await
    .map_err(unique_as("admin"))?;
    info!(admin_id = %row.id, "Admin created");
    Ok(row.into())
}

pub async fn get_admin_by_id(ctx: &mut TxContext, id: Uuid) -> TiaeResult<Admin> {
    let conn = ctx.main_tx().await?;
    sqlx::query_as::<_, AdminRow>(&format!("SELECT {ADMIN_COLUMNS} FROM admins WHERE id = $1"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(Admin::from)
        .ok_or_else(|| TiaeError::not_found("admin", id))
}

pub async fn find_admin_by_email(ctx: &mut TxContext, email: &str) -> TiaeResult<Option<Admin>> {
    let email = email.trim().to_lowercase();
    let conn = ctx.main_tx().await?;
    let row = sqlx::query_as::<_, AdminRow>(&format!(
        "SELECT {ADMIN_COLUMNS} FROM admins WHERE lower(email) = $1"
    ))
    .bind(&email)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(row.map(Admin::from))
}

pub async fn list_admins(ctx: &mut TxContext) -> TiaeResult<Vec<Admin>> {
    let conn = ctx.main_tx().await?;
    let rows = sqlx::query_as::<_, AdminRow>(&format!(
        "SELECT {ADMIN_COLUMNS} FROM admins ORDER BY lower(email)"
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(rows.into_iter().map(Admin::from).collect())
}

/// Redeem an admin URL token of purpose `signup` or `reset` and set the
/// admin's password.
///
/// The token is consumed and every valid admin session is invalidated in
/// the same transaction.
pub async fn set_admin_password(
    ctx: &mut TxContext,
    token_id: Uuid,
    new_password: &str,
    bcrypt_cost: u32,
) -> TiaeResult<Admin> {
    let token = url_token::get_url_token(ctx, UrlTokenScope::Admin, token_id)
        .await
        .map_err(|e| match e {
            TiaeError::NotFound { .. } => TiaeError::InvalidToken("unknown url token".into()),
            other => other,
        })?;
    token.ensure_redeemable(Utc::now(), &[UrlTokenPurpose::Signup, UrlTokenPurpose::Reset])?;

    let hash = password::hash_password(new_password, bcrypt_cost)?;
    let conn = ctx.main_tx().await?;
    let row = sqlx::query_as::<_, AdminRow>(&format!(
        "UPDATE admins SET password_hash = $2, updated_at = now() WHERE id = $1 \
         RETURNING {ADMIN_COLUMNS}"
    ))
    .bind(token.owner_id)
    .bind(&hash)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .ok_or_else(|| TiaeError::not_found("admin", token.owner_id))?;
    invalidate_admin_sessions(conn, token.owner_id).await?;

    url_token::consume_url_token(ctx, UrlTokenScope::Admin, token_id).await?;
    Ok(row.into())
}

/// Move every valid session of an admin to `invalid` in one statement.
pub async fn invalidate_admin_sessions(conn: &mut PgConnection, admin_id: Uuid) -> TiaeResult<u64> {
    let result = sqlx::query(
        "UPDATE admin_sessions SET status = 'invalid' WHERE admin_id = $1 AND status = 'valid'",
    )
    .bind(admin_id)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected())
}
