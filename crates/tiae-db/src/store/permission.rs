//! Permissions with their resources and actions, and their assignment to
//! service accounts.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tiae_core::effects::PostCommit;
use tiae_core::error::{TiaeError, TiaeResult};
use tiae_core::models::permission::{
    ActionType, CreatePermission, Permission, PermissionAction, PermissionResource,
    UpdatePermission,
};
use tiae_core::validation::{next_free_slug, require_non_empty, slug_base};
use tracing::info;
use uuid::Uuid;

use crate::context::TxContext;
use crate::error::{db_err, unique_as};
use crate::store::parse_column;

#[derive(Debug, FromRow)]
struct PermissionRow {
    id: Uuid,
    slug: String,
    name: String,
    description: Option<String>,
    effect: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ResourceRow {
    id: Uuid,
    permission_id: Uuid,
    bucket_name: String,
}

#[derive(Debug, FromRow)]
struct ActionRow {
    id: Uuid,
    permission_id: Uuid,
    action: String,
}

const PERMISSION_COLUMNS: &str = "id, slug, name, description, effect, created_at, updated_at";

/// Attach resources and actions to permission rows.
async fn hydrate(conn: &mut PgConnection, rows: Vec<PermissionRow>) -> TiaeResult<Vec<Permission>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

    let resources = sqlx::query_as::<_, ResourceRow>(
        "SELECT id, permission_id, bucket_name FROM permission_resources \
         WHERE permission_id = ANY($1) ORDER BY bucket_name, id",
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    let actions = sqlx::query_as::<_, ActionRow>(
        "SELECT id, permission_id, action FROM permission_actions \
         WHERE permission_id = ANY($1) ORDER BY action, id",
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;

    let mut resources_by: HashMap<Uuid, Vec<PermissionResource>> = HashMap::new();
    for r in resources {
        resources_by
            .entry(r.permission_id)
            .or_default()
            .push(PermissionResource {
                id: r.id,
                permission_id: r.permission_id,
                bucket_name: r.bucket_name,
            });
    }
    let mut actions_by: HashMap<Uuid, Vec<PermissionAction>> = HashMap::new();
    for a in actions {
        actions_by.entry(a.permission_id).or_default().push(PermissionAction {
            id: a.id,
            permission_id: a.permission_id,
            action: parse_column("permission_actions.action", &a.action)?,
        });
    }

    rows.into_iter()
        .map(|row| {
            Ok(Permission {
                id: row.id,
                effect: parse_column("permissions.effect", &row.effect)?,
                resources: resources_by.remove(&row.id).unwrap_or_default(),
                actions: actions_by.remove(&row.id).unwrap_or_default(),
                slug: row.slug,
                name: row.name,
                description: row.description,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
        })
        .collect()
}

fn clean_resources(resources: &[String]) -> TiaeResult<Vec<String>> {
    let cleaned: BTreeSet<String> = resources
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    if cleaned.is_empty() {
        return Err(TiaeError::InvalidArgument(
            "a permission needs at least one resource".into(),
        ));
    }
    Ok(cleaned.into_iter().collect())
}

fn clean_actions(actions: &[ActionType]) -> TiaeResult<Vec<ActionType>> {
    let cleaned: BTreeSet<ActionType> = actions.iter().copied().collect();
    if cleaned.is_empty() {
        return Err(TiaeError::InvalidArgument(
            "a permission needs at least one action".into(),
        ));
    }
    Ok(cleaned.into_iter().collect())
}

async fn insert_parts(
    conn: &mut PgConnection,
    permission_id: Uuid,
    resources: &[String],
    actions: &[ActionType],
) -> TiaeResult<()> {
    for bucket in resources {
        sqlx::query(
            "INSERT INTO permission_resources (id, permission_id, bucket_name) VALUES ($1, $2, $3)",
        )
        .bind(Uuid::new_v4())
        .bind(permission_id)
        .bind(bucket)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }
    for action in actions {
        sqlx::query("INSERT INTO permission_actions (id, permission_id, action) VALUES ($1, $2, $3)")
            .bind(Uuid::new_v4())
            .bind(permission_id)
            .bind(action.as_str())
            .execute(&mut *conn)
            .await
            .map_err(unique_as("permission action"))?;
    }
    Ok(())
}

/// Service accounts currently referencing a permission.
async fn referencing_service_accounts(
    conn: &mut PgConnection,
    permission_id: Uuid,
) -> TiaeResult<Vec<Uuid>> {
    sqlx::query_scalar(
        "SELECT service_account_id FROM service_account_permissions \
         WHERE permission_id = $1 ORDER BY service_account_id",
    )
    .bind(permission_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)
}

fn stage_syncs(ctx: &mut TxContext, tenant: &str, service_accounts: Vec<Uuid>) {
    for service_account_id in service_accounts {
        ctx.after_commit(PostCommit::SyncServiceAccount {
            tenant: tenant.to_string(),
            service_account_id,
        });
    }
}

/// Create a permission. The slug is the kebab form of the name, with a
/// numeric suffix when taken.
pub async fn add_permission(ctx: &mut TxContext, input: CreatePermission) -> TiaeResult<Permission> {
    require_non_empty("permission name", &input.name)?;
    let base = slug_base(&input.name)?;
    let resources = clean_resources(&input.resources)?;
    let actions = clean_actions(&input.actions)?;

    let conn = ctx.tenant_tx().await?;
    let taken: Vec<String> = sqlx::query_scalar(
        "SELECT lower(slug) FROM permissions WHERE lower(slug) = $1 OR lower(slug) LIKE $1 || '-%'",
    )
    .bind(&base)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    let slug = next_free_slug(&base, taken.iter().map(String::as_str));

    let id = Uuid::new_v4();
    let description = input
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());
    sqlx::query(
        "INSERT INTO permissions (id, slug, name, description, effect) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id)
    .bind(&slug)
    .bind(input.name.trim())
    .bind(&description)
    .bind(input.effect.as_str())
    .execute(&mut *conn)
    .await
    .map_err(unique_as("permission"))?;
    insert_parts(conn, id, &resources, &actions).await?;
    info!(permission = %slug, "Permission created");
    get_permission(ctx, id).await
}

pub async fn get_permission(ctx: &mut TxContext, id: Uuid) -> TiaeResult<Permission> {
    let conn = ctx.tenant_tx().await?;
    let row = sqlx::query_as::<_, PermissionRow>(&format!(
        "SELECT {PERMISSION_COLUMNS} FROM permissions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .ok_or_else(|| TiaeError::not_found("permission", id))?;
    hydrate(conn, vec![row])
        .await?
        .pop()
        .ok_or_else(|| TiaeError::not_found("permission", id))
}

pub async fn get_permission_by_slug(ctx: &mut TxContext, slug: &str) -> TiaeResult<Permission> {
    let conn = ctx.tenant_tx().await?;
    let row = sqlx::query_as::<_, PermissionRow>(&format!(
        "SELECT {PERMISSION_COLUMNS} FROM permissions WHERE lower(slug) = lower($1)"
    ))
    .bind(slug)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .ok_or_else(|| TiaeError::not_found("permission", slug))?;
    hydrate(conn, vec![row])
        .await?
        .pop()
        .ok_or_else(|| TiaeError::not_found("permission", slug))
}

pub async fn list_permissions(ctx: &mut TxContext) -> TiaeResult<Vec<Permission>> {
    let conn = ctx.tenant_tx().await?;
    let rows = sqlx::query_as::<_, PermissionRow>(&format!(
        "SELECT {PERMISSION_COLUMNS} FROM permissions ORDER BY slug"
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    hydrate(conn, rows).await
}

/// Update a permission in place. Resources and actions, when given,
/// replace the current sets. Every referencing service account is
/// re-synced after commit.
pub async fn update_permission(
    ctx: &mut TxContext,
    id: Uuid,
    input: UpdatePermission,
) -> TiaeResult<Permission> {
    let current = get_permission(ctx, id).await?;
    let tenant = ctx.require_tenant()?.short_name.clone();

    let name = match &input.name {
        Some(n) => {
            require_non_empty("permission name", n)?;
            n.trim().to_string()
        }
        None => current.name.clone(),
    };
    let description = match input.description {
        Some(d) => d.map(|d| d.trim().to_string()).filter(|d| !d.is_empty()),
        None => current.description.clone(),
    };
    let effect = input.effect.unwrap_or(current.effect);
    let resources = input.resources.as_deref().map(clean_resources).transpose()?;
    let actions = input.actions.as_deref().map(clean_actions).transpose()?;

    let conn = ctx.tenant_tx().await?;
    sqlx::query(
        "UPDATE permissions SET name = $2, description = $3, effect = $4, updated_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(&name)
    .bind(&description)
    .bind(effect.as_str())
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    if let Some(resources) = &resources {
        sqlx::query("DELETE FROM permission_resources WHERE permission_id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        insert_parts(conn, id, resources, &[]).await?;
    }
    let conn = ctx.tenant_tx().await?;
    if let Some(actions) = &actions {
        sqlx::query("DELETE FROM permission_actions WHERE permission_id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        insert_parts(conn, id, &[], actions).await?;
    }

    let conn = ctx.tenant_tx().await?;
    let referencing = referencing_service_accounts(conn, id).await?;
    stage_syncs(ctx, &tenant, referencing);
    get_permission(ctx, id).await
}

/// Delete a permission with its resources, actions and assignments.
/// Service accounts that held it are re-synced after commit.
pub async fn delete_permission(ctx: &mut TxContext, id: Uuid) -> TiaeResult<()> {
    let tenant = ctx.require_tenant()?.short_name.clone();
    let conn = ctx.tenant_tx().await?;
    let referencing = referencing_service_accounts(&mut *conn, id).await?;
    let deleted = sqlx::query("DELETE FROM permissions WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?
        .rows_affected();
    if deleted == 0 {
        return Err(TiaeError::not_found("permission", id));
    }
    stage_syncs(ctx, &tenant, referencing);
    Ok(())
}

/// Make `permission_ids` the exact permission set of a service account.
/// Applying the same set twice changes nothing; either way the account is
/// synced after commit.
pub async fn assign_permissions_to_sa(
    ctx: &mut TxContext,
    service_account_id: Uuid,
    permission_ids: &[Uuid],
) -> TiaeResult<()> {
    let tenant = ctx.require_tenant()?.short_name.clone();
    let wanted: Vec<Uuid> = permission_ids
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let conn = ctx.tenant_tx().await?;
    let exists: Option<Uuid> =
        sqlx::query_scalar("SELECT id FROM service_accounts WHERE id = $1 FOR UPDATE")
            .bind(service_account_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
    if exists.is_none() {
        return Err(TiaeError::not_found("service account", service_account_id));
    }

    let found: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM permissions WHERE id = ANY($1)")
        .bind(&wanted)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    if let Some(missing) = wanted.iter().find(|id| !found.contains(id)) {
        return Err(TiaeError::not_found("permission", missing));
    }

    sqlx::query(
        "DELETE FROM service_account_permissions \
         WHERE service_account_id = $1 AND NOT (permission_id = ANY($2))",
    )
    .bind(service_account_id)
    .bind(&wanted)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    sqlx::query(
        "INSERT INTO service_account_permissions (service_account_id, permission_id) \
         SELECT $1, unnest($2::uuid[]) ON CONFLICT DO NOTHING",
    )
    .bind(service_account_id)
    .bind(&wanted)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    stage_syncs(ctx, &tenant, vec![service_account_id]);
    Ok(())
}

/// Permissions assigned to a service account, hydrated.
pub async fn permissions_for_service_account(
    conn: &mut PgConnection,
    service_account_id: Uuid,
) -> TiaeResult<Vec<Permission>> {
    let rows = sqlx::query_as::<_, PermissionRow>(
        "SELECT p.id, p.slug, p.name, p.description, p.effect, p.created_at, p.updated_at \
         FROM permissions p \
         JOIN service_account_permissions sap ON sap.permission_id = p.id \
         WHERE sap.service_account_id = $1 ORDER BY p.slug",
    )
    .bind(service_account_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    hydrate(conn, rows).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_are_trimmed_deduplicated_and_sorted() {
        let cleaned = clean_resources(&[
            " logs ".into(),
            "backups".into(),
            "logs".into(),
            "".into(),
        ])
        .unwrap();
        assert_eq!(cleaned, vec!["backups", "logs"]);
        assert!(clean_resources(&["  ".into()]).is_err());
    }

    #[test]
    fn actions_are_deduplicated() {
        let cleaned = clean_actions(&[ActionType::Write, ActionType::Read, ActionType::Write]).unwrap();
        assert_eq!(cleaned, vec![ActionType::Read, ActionType::Write]);
        assert!(clean_actions(&[]).is_err());
    }
}
