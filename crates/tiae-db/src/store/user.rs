//! Tenant users.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tiae_auth::password;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::user::{CreateUser, User};
use tiae_core::validation::{normalize_email, require_non_empty};
use tracing::info;
use uuid::Uuid;

use crate::context::TxContext;
use crate::error::{db_err, unique_as};

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    email: String,
    password_hash: Option<String>,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    fn into_user(self, tenant_id: Uuid) -> User {
        User {
            id: self.id,
            tenant_id,
            name: self.name,
            email: self.email,
            password_hash: self.password_hash,
            enabled: self.enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

const USER_COLUMNS: &str = "id, name, email, password_hash, enabled, created_at, updated_at";

/// Add a user to the attached tenant.
///
/// With an initial password the user is enabled straight away; without
/// one it stays disabled until an invite is redeemed.
pub async fn add_user(ctx: &mut TxContext, input: CreateUser, bcrypt_cost: u32) -> TiaeResult<User> {
    require_non_empty("user name", &input.name)?;
    let email = normalize_email(&input.email)?;
    let password_hash = match &input.password {
        Some(pw) => Some(password::hash_password(pw, bcrypt_cost)?),
        None => None,
    };
    let enabled = password_hash.is_some();

    let tenant_id = ctx.require_tenant()?.id;
    let conn = ctx.tenant_tx().await?;
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "INSERT INTO users (id, name, email, password_hash, enabled) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(input.name.trim())
    .bind(&email)
    .bind(&password_hash)
    .bind(enabled)
    .fetch_one(&mut *conn)
    .await
    .map_err(unique_as("user"))?;

    Ok(row.into_user(tenant_id))
}

pub async fn get_user_by_id(ctx: &mut TxContext, id: Uuid) -> TiaeResult<User> {
    let tenant_id = ctx.require_tenant()?.id;
    let conn = ctx.tenant_tx().await?;
    sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(|row| row.into_user(tenant_id))
        .ok_or_else(|| TiaeError::not_found("user", id))
}

/// Case-insensitive lookup by email. Returns `None` when absent.
pub async fn find_user_by_email(ctx: &mut TxContext, email: &str) -> TiaeResult<Option<User>> {
    let tenant_id = ctx.require_tenant()?.id;
    let email = email.trim().to_lowercase();
    let conn = ctx.tenant_tx().await?;
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = $1"
    ))
    .bind(&email)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(row.map(|row| row.into_user(tenant_id)))
}

pub async fn get_user_by_email(ctx: &mut TxContext, email: &str) -> TiaeResult<User> {
    find_user_by_email(ctx, email)
        .await?
        .ok_or_else(|| TiaeError::not_found("user", email))
}

pub async fn list_users(ctx: &mut TxContext) -> TiaeResult<Vec<User>> {
    let tenant_id = ctx.require_tenant()?.id;
    let conn = ctx.tenant_tx().await?;
    let rows = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users ORDER BY lower(email)"
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(rows.into_iter().map(|row| row.into_user(tenant_id)).collect())
}

/// Delete a user and invalidate all of its valid sessions in the same
/// transaction.
pub async fn delete_user(ctx: &mut TxContext, id: Uuid) -> TiaeResult<()> {
    let conn = ctx.tenant_tx().await?;
    let deleted = sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?
        .rows_affected();
    if deleted == 0 {
        return Err(TiaeError::not_found("user", id));
    }
    let invalidated = invalidate_user_sessions(conn, id).await?;
    info!(user_id = %id, invalidated, "User deleted");
    Ok(())
}

/// Enable or disable a user. Disabling invalidates the user's sessions.
/// Setting the current value again changes nothing.
pub async fn set_user_enabled(ctx: &mut TxContext, id: Uuid, enabled: bool) -> TiaeResult<User> {
    let tenant_id = ctx.require_tenant()?.id;
    let conn = ctx.tenant_tx().await?;
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "UPDATE users SET enabled = $2, \
         updated_at = CASE WHEN enabled = $2 THEN updated_at ELSE now() END \
         WHERE id = $1 RETURNING {USER_COLUMNS}"
    ))
    .bind(id)
    .bind(enabled)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .ok_or_else(|| TiaeError::not_found("user", id))?;

    if !enabled {
        invalidate_user_sessions(conn, id).await?;
    }
    Ok(row.into_user(tenant_id))
}

/// Replace a user's password and invalidate every valid session.
pub async fn set_user_password(
    ctx: &mut TxContext,
    id: Uuid,
    new_password: &str,
    bcrypt_cost: u32,
) -> TiaeResult<()> {
    let hash = password::hash_password(new_password, bcrypt_cost)?;
    let conn = ctx.tenant_tx().await?;
    let updated = sqlx::query(
        "UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(&hash)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?
    .rows_affected();
    if updated == 0 {
        return Err(TiaeError::not_found("user", id));
    }
    invalidate_user_sessions(conn, id).await?;
    Ok(())
}

/// Set the password and enable the user. Used when an invite is redeemed.
pub async fn activate_with_password(
    ctx: &mut TxContext,
    id: Uuid,
    new_password: &str,
    bcrypt_cost: u32,
) -> TiaeResult<User> {
    set_user_password(ctx, id, new_password, bcrypt_cost).await?;
    set_user_enabled(ctx, id, true).await
}

/// Move every valid session of `user_id` to `invalid` in one statement.
pub async fn invalidate_user_sessions(conn: &mut PgConnection, user_id: Uuid) -> TiaeResult<u64> {
    let result = sqlx::query(
        "UPDATE sessions SET status = 'invalid' WHERE user_id = $1 AND status = 'valid'",
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected())
}
