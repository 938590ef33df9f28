//! Service accounts and their credentials.
//!
//! The access key is fixed at creation and doubles as the IAM user name.
//! IAM changes are staged as post-commit effects; only secret rotation
//! talks to IAM inline, from the control plane.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tiae_auth::secret;
use tiae_core::effects::PostCommit;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::service_account::{
    CreateServiceAccount, ServiceAccount, ServiceAccountCredential, ServiceAccountGrant,
    UpdateServiceAccount,
};
use tiae_core::validation::{next_free_slug, require_non_empty, slug_base, slugify};
use tracing::info;
use uuid::Uuid;

use crate::context::TxContext;
use crate::error::{db_err, unique_as};
use crate::store::{permission, tenant};

#[derive(Debug, FromRow)]
struct ServiceAccountRow {
    id: Uuid,
    slug: String,
    name: String,
    access_key: String,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ServiceAccountRow> for ServiceAccount {
    fn from(row: ServiceAccountRow) -> Self {
        ServiceAccount {
            id: row.id,
            slug: row.slug,
            name: row.name,
            access_key: row.access_key,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const SA_COLUMNS: &str = "id, slug, name, access_key, enabled, created_at, updated_at";

/// Attach `short_name` unless the context already carries it.
async fn ensure_tenant(ctx: &mut TxContext, short_name: &str) -> TiaeResult<String> {
    match ctx.tenant() {
        Some(t) if t.short_name == short_name => Ok(t.short_name.clone()),
        Some(_) => Err(TiaeError::PermissionDenied(format!(
            "service account must belong to tenant {short_name}"
        ))),
        None => Ok(tenant::attach(ctx, short_name).await?.short_name),
    }
}

/// Create an enabled service account with a fresh credential pair.
///
/// An explicit slug must be free; a slug derived from the name takes a
/// numeric suffix on collision. The IAM user is created after commit.
pub async fn add_service_account(
    ctx: &mut TxContext,
    tenant_short_name: &str,
    input: CreateServiceAccount,
) -> TiaeResult<(ServiceAccount, ServiceAccountCredential)> {
    require_non_empty("service account name", &input.name)?;
    let explicit = match input.slug.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(requested) => {
            let slug = slugify(requested);
            if slug != requested.to_lowercase() {
                return Err(TiaeError::InvalidArgument(format!(
                    "slug {requested:?} must be lowercase letters, digits and dashes"
                )));
            }
            Some(slug)
        }
        None => None,
    };
    let derived = match explicit {
        Some(_) => None,
        None => Some(slug_base(&input.name)?),
    };
    let tenant = ensure_tenant(ctx, tenant_short_name).await?;

    let conn = ctx.tenant_tx().await?;
    let slug = match (explicit, derived) {
        (Some(slug), _) => slug,
        (None, Some(base)) => {
            let taken: Vec<String> = sqlx::query_scalar(
                "SELECT lower(slug) FROM service_accounts \
                 WHERE lower(slug) = $1 OR lower(slug) LIKE $1 || '-%'",
            )
            .bind(&base)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
            next_free_slug(&base, taken.iter().map(String::as_str))
        }
        (None, None) => return Err(TiaeError::Internal("no slug candidate".into())),
    };

    let (access_key, secret_key) = secret::generate_credentials();
    let row = sqlx::query_as::<_, ServiceAccountRow>(&format!(
        "INSERT INTO service_accounts (id, slug, name, access_key, enabled) \
         VALUES ($1, $2, $3, $4, TRUE) RETURNING {SA_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(&slug)
    .bind(input.name.trim())
    .bind(&access_key)
    .fetch_one(&mut *conn)
    .await
    .map_err(unique_as("service account"))?;
    sqlx::query(
        "INSERT INTO service_account_credentials (service_account_id, secret_key) VALUES ($1, $2)",
    )
    .bind(row.id)
    .bind(&secret_key)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    let account = ServiceAccount::from(row);
    ctx.after_commit(PostCommit::ProvisionServiceAccount {
        tenant: tenant.clone(),
        service_account_id: account.id,
        access_key: access_key.clone(),
        secret_key: secret_key.clone(),
    });
    info!(%tenant, service_account = %account.slug, "Service account staged");

    let credential = ServiceAccountCredential {
        service_account_id: account.id,
        access_key,
        secret_key,
    };
    Ok((account, credential))
}

pub async fn get_service_account_by_id(ctx: &mut TxContext, id: Uuid) -> TiaeResult<ServiceAccount> {
    let conn = ctx.tenant_tx().await?;
    sqlx::query_as::<_, ServiceAccountRow>(&format!(
        "SELECT {SA_COLUMNS} FROM service_accounts WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .map(ServiceAccount::from)
    .ok_or_else(|| TiaeError::not_found("service account", id))
}

pub async fn get_service_account_by_slug(
    ctx: &mut TxContext,
    slug: &str,
) -> TiaeResult<ServiceAccount> {
    let conn = ctx.tenant_tx().await?;
    sqlx::query_as::<_, ServiceAccountRow>(&format!(
        "SELECT {SA_COLUMNS} FROM service_accounts WHERE lower(slug) = lower($1)"
    ))
    .bind(slug.trim())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .map(ServiceAccount::from)
    .ok_or_else(|| TiaeError::not_found("service account", slug))
}

pub async fn list_service_accounts(ctx: &mut TxContext) -> TiaeResult<Vec<ServiceAccount>> {
    let conn = ctx.tenant_tx().await?;
    let rows = sqlx::query_as::<_, ServiceAccountRow>(&format!(
        "SELECT {SA_COLUMNS} FROM service_accounts ORDER BY slug"
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(rows.into_iter().map(ServiceAccount::from).collect())
}

/// Apply a staged update. IAM status and policy follow after commit.
pub async fn update_service_account_fields(
    ctx: &mut TxContext,
    id: Uuid,
    update: UpdateServiceAccount,
) -> TiaeResult<ServiceAccount> {
    if let Some(name) = &update.name {
        require_non_empty("service account name", name)?;
    }
    let tenant = ctx.require_tenant()?.short_name.clone();

    let conn = ctx.tenant_tx().await?;
    let row = sqlx::query_as::<_, ServiceAccountRow>(&format!(
        "UPDATE service_accounts SET \
         name = COALESCE($2, name), enabled = COALESCE($3, enabled), updated_at = now() \
         WHERE id = $1 RETURNING {SA_COLUMNS}"
    ))
    .bind(id)
    .bind(update.name.as_deref().map(str::trim))
    .bind(update.enabled)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .ok_or_else(|| TiaeError::not_found("service account", id))?;

    if let Some(permission_ids) = &update.permission_ids {
        permission::assign_permissions_to_sa(ctx, id, permission_ids).await?;
    }
    ctx.after_commit(PostCommit::SyncServiceAccount {
        tenant,
        service_account_id: id,
    });
    Ok(row.into())
}

/// Remove the account's rows. The IAM user goes after commit.
pub async fn delete_service_account(ctx: &mut TxContext, id: Uuid) -> TiaeResult<ServiceAccount> {
    let tenant = ctx.require_tenant()?.short_name.clone();
    let conn = ctx.tenant_tx().await?;
    let account = sqlx::query_as::<_, ServiceAccountRow>(&format!(
        "DELETE FROM service_accounts WHERE id = $1 RETURNING {SA_COLUMNS}"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .map(ServiceAccount::from)
    .ok_or_else(|| TiaeError::not_found("service account", id))?;

    ctx.after_commit(PostCommit::RemoveServiceAccount {
        tenant,
        service_account_id: account.id,
        access_key: account.access_key.clone(),
    });
    info!(service_account = %account.slug, "Service account deletion staged");
    Ok(account)
}

pub async fn get_credential(ctx: &mut TxContext, id: Uuid) -> TiaeResult<ServiceAccountCredential> {
    let conn = ctx.tenant_tx().await?;
    let row: Option<(String, String)> = sqlx::query_as(
        "SELECT sa.access_key, c.secret_key FROM service_accounts sa \
         JOIN service_account_credentials c ON c.service_account_id = sa.id \
         WHERE sa.id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    let (access_key, secret_key) =
        row.ok_or_else(|| TiaeError::not_found("service account credential", id))?;
    Ok(ServiceAccountCredential {
        service_account_id: id,
        access_key,
        secret_key,
    })
}

/// Replace the stored secret, locking the row. Returns the new credential
/// and the previous secret so the caller can restore IAM if the commit
/// fails.
pub async fn rotate_secret(
    ctx: &mut TxContext,
    id: Uuid,
) -> TiaeResult<(ServiceAccountCredential, String)> {
    let conn = ctx.tenant_tx().await?;
    let previous: Option<String> = sqlx::query_scalar(
        "SELECT secret_key FROM service_account_credentials \
         WHERE service_account_id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    let previous = previous.ok_or_else(|| TiaeError::not_found("service account credential", id))?;

    let secret_key = secret::generate_secret_key();
    sqlx::query(
        "UPDATE service_account_credentials SET secret_key = $2, updated_at = now() \
         WHERE service_account_id = $1",
    )
    .bind(id)
    .bind(&secret_key)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    let credential = get_credential(ctx, id).await?;
    Ok((credential, previous))
}

/// Committed view of one service account for the IAM projection. `None`
/// when the account no longer exists.
pub async fn load_grant(
    conn: &mut PgConnection,
    id: Uuid,
) -> TiaeResult<Option<ServiceAccountGrant>> {
    let row: Option<(String, bool)> =
        sqlx::query_as("SELECT access_key, enabled FROM service_accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
    let Some((access_key, enabled)) = row else {
        return Ok(None);
    };
    let permissions = permission::permissions_for_service_account(conn, id).await?;
    Ok(Some(ServiceAccountGrant {
        service_account_id: id,
        access_key,
        enabled,
        permissions,
    }))
}
