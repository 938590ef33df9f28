//! Tenants in the global catalog and their schemas.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tiae_auth::secret;
use tiae_core::effects::PostCommit;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::tenant::{CreateTenant, Tenant};
use tiae_core::models::user::{CreateUser, User};
use tiae_core::validation::{normalize_email, require_non_empty, validate_short_name};
use tracing::info;
use uuid::Uuid;

use crate::context::TxContext;
use crate::error::{db_err, unique_as};
use crate::schema;
use crate::store::{email_template, user};

#[derive(Debug, FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    short_name: String,
    enabled: bool,
    cost_per_gb: Option<f64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Tenant {
            id: row.id,
            name: row.name,
            short_name: row.short_name,
            enabled: row.enabled,
            cost_per_gb: row.cost_per_gb,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const TENANT_COLUMNS: &str = "id, name, short_name, enabled, cost_per_gb, created_at, updated_at";

/// Create a tenant, its schema and its first user in one unit of work.
///
/// The short name is checked before anything touches the database. The
/// first user starts disabled and without a password; the caller sends
/// the signup invite. Tenant root credentials and the proxy entry are
/// staged for after commit.
pub async fn add_tenant(
    ctx: &mut TxContext,
    input: CreateTenant,
    bcrypt_cost: u32,
) -> TiaeResult<(Tenant, User)> {
    validate_short_name(&input.short_name)?;
    require_non_empty("tenant name", &input.name)?;
    require_non_empty("first user name", &input.first_user_name)?;
    let first_email = normalize_email(&input.first_user_email)?;

    let conn = ctx.main_tx().await?;
    let row = sqlx::query_as::<_, TenantRow>(&format!(
        "INSERT INTO tenants (id, name, short_name, enabled, cost_per_gb) \
         VALUES ($1, $2, $3, TRUE, $4) RETURNING {TENANT_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(input.name.trim())
    .bind(&input.short_name)
    .bind(input.cost_per_gb)
    .fetch_one(&mut *conn)
    .await
    .map_err(unique_as("tenant"))?;
    let tenant = Tenant::from(row);

    ctx.set_tenant(tenant.clone()).await?;
    let conn = ctx.tenant_tx().await?;
    schema::create_tenant_schema(conn, &tenant.short_name)
        .await
        .map_err(|e| TiaeError::ProvisioningFailed(e.to_string()))?;
    email_template::seed_defaults(ctx).await?;

    let first_user = user::add_user(
        ctx,
        CreateUser {
            name: input.first_user_name,
            email: first_email,
            password: None,
        },
        bcrypt_cost,
    )
    .await?;

    let (access_key, secret_key) = secret::generate_credentials();
    ctx.after_commit(PostCommit::StoreTenantCredentials {
        tenant: tenant.short_name.clone(),
        access_key,
        secret_key,
    });
    ctx.after_commit(PostCommit::SyncProxyConfig);

    info!(tenant = %tenant.short_name, tenant_id = %tenant.id, "Tenant staged");
    Ok((tenant, first_user))
}

pub async fn get_tenant_by_short_name(ctx: &mut TxContext, short_name: &str) -> TiaeResult<Tenant> {
    validate_short_name(short_name)?;
    let conn = ctx.main_tx().await?;
    sqlx::query_as::<_, TenantRow>(&format!(
        "SELECT {TENANT_COLUMNS} FROM tenants WHERE short_name = $1"
    ))
    .bind(short_name)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .map(Tenant::from)
    .ok_or_else(|| TiaeError::not_found("tenant", short_name))
}

pub async fn get_tenant_by_id(ctx: &mut TxContext, id: Uuid) -> TiaeResult<Tenant> {
    let conn = ctx.main_tx().await?;
    sqlx::query_as::<_, TenantRow>(&format!(
        "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .map(Tenant::from)
    .ok_or_else(|| TiaeError::not_found("tenant", id))
}

pub async fn list_tenants(ctx: &mut TxContext) -> TiaeResult<Vec<Tenant>> {
    let conn = ctx.main_tx().await?;
    let rows = sqlx::query_as::<_, TenantRow>(&format!(
        "SELECT {TENANT_COLUMNS} FROM tenants ORDER BY short_name"
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(rows.into_iter().map(Tenant::from).collect())
}

/// Attach the tenant named `short_name` to the context.
pub async fn attach(ctx: &mut TxContext, short_name: &str) -> TiaeResult<Tenant> {
    let tenant = get_tenant_by_short_name(ctx, short_name).await?;
    ctx.set_tenant(tenant.clone()).await?;
    Ok(tenant)
}

/// Attach the tenant with `id` to the context.
pub async fn attach_by_id(ctx: &mut TxContext, id: Uuid) -> TiaeResult<Tenant> {
    let tenant = get_tenant_by_id(ctx, id).await?;
    ctx.set_tenant(tenant.clone()).await?;
    Ok(tenant)
}

/// Enable or disable a tenant. Disabling invalidates every valid session
/// of the tenant; either way the proxy map is re-synced after commit.
pub async fn set_tenant_enabled(ctx: &mut TxContext, id: Uuid, enabled: bool) -> TiaeResult<Tenant> {
    let conn = ctx.main_tx().await?;
    let row = sqlx::query_as::<_, TenantRow>(&format!(
        "UPDATE tenants SET enabled = $2, updated_at = now() WHERE id = $1 \
         RETURNING {TENANT_COLUMNS}"
    ))
    .bind(id)
    .bind(enabled)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .ok_or_else(|| TiaeError::not_found("tenant", id))?;
    let tenant = Tenant::from(row);

    if !enabled {
        if ctx.tenant().is_none() {
            ctx.set_tenant(tenant.clone()).await?;
        }
        let conn = ctx.tenant_tx().await?;
        let invalidated =
            sqlx::query("UPDATE sessions SET status = 'invalid' WHERE status = 'valid'")
                .execute(&mut *conn)
                .await
                .map_err(db_err)?
                .rows_affected();
        info!(tenant = %tenant.short_name, invalidated, "Tenant disabled");
    }
    ctx.after_commit(PostCommit::SyncProxyConfig);
    Ok(tenant)
}

/// Delete a tenant and drop its schema. The cached pool is evicted and
/// the proxy map rewritten after commit.
pub async fn delete_tenant(ctx: &mut TxContext, id: Uuid) -> TiaeResult<Tenant> {
    let tenant = match ctx.tenant() {
        Some(t) if t.id == id => t.clone(),
        Some(_) => {
            return Err(TiaeError::InvalidArgument(
                "context is attached to a different tenant".into(),
            ));
        }
        None => attach_by_id(ctx, id).await?,
    };

    let conn = ctx.tenant_tx().await?;
    schema::drop_tenant_schema(conn, &tenant.short_name).await?;

    let conn = ctx.main_tx().await?;
    sqlx::query("DELETE FROM tenants WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    ctx.after_commit(PostCommit::SyncProxyConfig);
    ctx.after_commit(PostCommit::EvictTenantConnection {
        tenant: tenant.short_name.clone(),
    });
    info!(tenant = %tenant.short_name, "Tenant deletion staged");
    Ok(tenant)
}

/// Short names of every enabled tenant, sorted. Reads committed state
/// straight from the pool.
pub async fn live_short_names(pool: &PgPool) -> TiaeResult<Vec<String>> {
    sqlx::query_scalar("SELECT short_name FROM tenants WHERE enabled ORDER BY short_name")
        .fetch_all(pool)
        .await
        .map_err(db_err)
}
