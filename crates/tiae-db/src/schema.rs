//! Schema definitions and migration runner.
//!
//! Two scopes are migrated independently: the global catalog schema in the
//! provisioning database and every tenant schema in the tenants database.
//! Each scope records its applied versions in its own `_migrations` table,
//! resolved through the connection's `search_path`.

use sqlx::PgConnection;
use tracing::info;

use crate::connection::{ConnectionRegistry, quote_schema};
use crate::error::DbError;

const MIGRATION_TABLE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
);";

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

static PROVISIONING_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "global_catalog",
        sql: PROVISIONING_V1,
    },
    Migration {
        version: 2,
        name: "session_routes",
        sql: PROVISIONING_V2,
    },
];

static TENANT_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "identity",
        sql: TENANT_V1,
    },
    Migration {
        version: 2,
        name: "email_templates",
        sql: TENANT_V2,
    },
];

// -----------------------------------------------------------------------
// Global catalog
// -----------------------------------------------------------------------

const PROVISIONING_V1: &str = "\
CREATE TABLE admins (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    password_hash TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX admins_email_key ON admins (lower(email));

CREATE TABLE tenants (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    short_name TEXT NOT NULL UNIQUE CHECK (short_name ~ '^[a-z0-9-]{1,63}$'),
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    cost_per_gb DOUBLE PRECISION,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE admin_sessions (
    id UUID PRIMARY KEY,
    admin_id UUID NOT NULL REFERENCES admins (id) ON DELETE CASCADE,
    refresh_token_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'valid'
        CHECK (status IN ('valid', 'invalid', 'expired')),
    expires_at TIMESTAMPTZ NOT NULL,
    refresh_expires_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX admin_sessions_valid_idx ON admin_sessions (admin_id) WHERE status = 'valid';

CREATE TABLE admin_url_tokens (
    id UUID PRIMARY KEY,
    admin_id UUID NOT NULL REFERENCES admins (id) ON DELETE CASCADE,
    purpose TEXT NOT NULL CHECK (purpose IN ('signup', 'reset', 'forgot')),
    expires_at TIMESTAMPTZ NOT NULL,
    consumed BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
";

const PROVISIONING_V2: &str = "\
CREATE TABLE session_routes (
    session_id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants (id) ON DELETE CASCADE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX session_routes_tenant_idx ON session_routes (tenant_id);
";

// -----------------------------------------------------------------------
// Tenant schema
// -----------------------------------------------------------------------

const TENANT_V1: &str = "\
CREATE TABLE users (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    password_hash TEXT,
    enabled BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX users_email_key ON users (lower(email));

CREATE TABLE service_accounts (
    id UUID PRIMARY KEY,
    slug TEXT NOT NULL,
    name TEXT NOT NULL,
    access_key TEXT NOT NULL UNIQUE,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX service_accounts_slug_key ON service_accounts (lower(slug));

CREATE TABLE service_account_credentials (
    service_account_id UUID PRIMARY KEY
        REFERENCES service_accounts (id) ON DELETE CASCADE,
    secret_key TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE permissions (
    id UUID PRIMARY KEY,
    slug TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    effect TEXT NOT NULL CHECK (effect IN ('allow', 'deny')),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX permissions_slug_key ON permissions (lower(slug));

CREATE TABLE permission_resources (
    id UUID PRIMARY KEY,
    permission_id UUID NOT NULL REFERENCES permissions (id) ON DELETE CASCADE,
    bucket_name TEXT NOT NULL
);
CREATE INDEX permission_resources_permission_idx ON permission_resources (permission_id);

CREATE TABLE permission_actions (
    id UUID PRIMARY KEY,
    permission_id UUID NOT NULL REFERENCES permissions (id) ON DELETE CASCADE,
    action TEXT NOT NULL CHECK (action IN ('read', 'write', 'readwrite')),
    UNIQUE (permission_id, action)
);

CREATE TABLE service_account_permissions (
    service_account_id UUID NOT NULL REFERENCES service_accounts (id) ON DELETE CASCADE,
    permission_id UUID NOT NULL REFERENCES permissions (id) ON DELETE CASCADE,
    PRIMARY KEY (service_account_id, permission_id)
);
CREATE INDEX service_account_permissions_permission_idx
    ON service_account_permissions (permission_id);

-- user_id is a logical reference only: deleting a user invalidates its
-- sessions instead of removing them.
CREATE TABLE sessions (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL,
    tenant_id UUID NOT NULL,
    refresh_token_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'valid'
        CHECK (status IN ('valid', 'invalid', 'expired')),
    expires_at TIMESTAMPTZ NOT NULL,
    refresh_expires_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX sessions_valid_user_idx ON sessions (user_id) WHERE status = 'valid';

CREATE TABLE url_tokens (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES users (id) ON DELETE CASCADE,
    purpose TEXT NOT NULL CHECK (purpose IN ('signup', 'reset', 'forgot')),
    expires_at TIMESTAMPTZ NOT NULL,
    consumed BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
";

const TENANT_V2: &str = "\
CREATE TABLE email_templates (
    purpose TEXT PRIMARY KEY CHECK (purpose IN ('signup', 'reset', 'forgot')),
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
";

async fn apply(
    conn: &mut PgConnection,
    scope: &str,
    migrations: &[Migration],
) -> Result<u32, DbError> {
    sqlx::raw_sql(MIGRATION_TABLE_DDL).execute(&mut *conn).await?;

    let current: i32 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM _migrations")
        .fetch_one(&mut *conn)
        .await?;

    let mut applied = 0;
    for migration in migrations
        .iter()
        .filter(|m| i64::from(m.version) > i64::from(current))
    {
        info!(
            scope,
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        sqlx::raw_sql(migration.sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                DbError::Migration(format!(
                    "{scope} migration v{} '{}' failed: {e}",
                    migration.version, migration.name,
                ))
            })?;

        sqlx::query("INSERT INTO _migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version as i32)
            .bind(migration.name)
            .execute(&mut *conn)
            .await?;
        applied += 1;
    }
    Ok(applied)
}

/// Create the global-catalog schema and bring it to the latest version.
pub async fn setup(registry: &ConnectionRegistry) -> Result<(), DbError> {
    let schema = quote_schema(&registry.config().schema)?;
    let mut tx = registry.get_db().begin().await?;

    // Serialise concurrent start-ups.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext('tiae-setup'))")
        .execute(&mut *tx)
        .await?;
    sqlx::raw_sql(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
        .execute(&mut *tx)
        .await?;
    let applied = apply(&mut tx, "provisioning", PROVISIONING_MIGRATIONS).await?;
    tx.commit().await?;

    info!(applied, "Provisioning schema is up to date");
    Ok(())
}

/// Create a tenant schema and its tables inside the caller's transaction.
pub async fn create_tenant_schema(conn: &mut PgConnection, short_name: &str) -> Result<(), DbError> {
    let schema = quote_schema(short_name)?;
    sqlx::raw_sql(&format!("CREATE SCHEMA {schema}"))
        .execute(&mut *conn)
        .await?;
    sqlx::raw_sql(&format!("SET LOCAL search_path TO {schema}"))
        .execute(&mut *conn)
        .await?;
    apply(conn, short_name, TENANT_MIGRATIONS).await?;
    Ok(())
}

/// Drop a tenant schema and everything in it.
pub async fn drop_tenant_schema(conn: &mut PgConnection, short_name: &str) -> Result<(), DbError> {
    let schema = quote_schema(short_name)?;
    sqlx::raw_sql(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Migrate every tenant schema listed in the global catalog. Returns the
/// short names that received at least one migration.
pub async fn setup_migrate(registry: &ConnectionRegistry) -> Result<Vec<String>, DbError> {
    let short_names: Vec<String> =
        sqlx::query_scalar("SELECT short_name FROM tenants ORDER BY short_name")
            .fetch_all(registry.get_db())
            .await?;

    let mut migrated = Vec::new();
    for short_name in short_names {
        let pool = registry.get_tenant_db(&short_name).await?;
        let mut tx = pool.begin().await?;
        let applied = apply(&mut tx, &short_name, TENANT_MIGRATIONS).await?;
        tx.commit().await?;
        if applied > 0 {
            info!(tenant = %short_name, applied, "Tenant schema migrated");
            migrated.push(short_name);
        }
    }
    Ok(migrated)
}

/// Latest tenant schema version known to this build.
pub fn tenant_schema_version() -> u32 {
    TENANT_MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_increasing() {
        for set in [PROVISIONING_MIGRATIONS, TENANT_MIGRATIONS] {
            for pair in set.windows(2) {
                assert!(pair[0].version < pair[1].version);
            }
        }
        assert_eq!(tenant_schema_version(), 2);
    }

    #[test]
    fn tenant_tables_are_unqualified() {
        // Tenant DDL must resolve through search_path.
        for m in TENANT_MIGRATIONS {
            assert!(!m.sql.contains("provisioning."), "{} is schema-qualified", m.name);
        }
    }

    #[test]
    fn short_name_check_matches_validator() {
        assert!(PROVISIONING_V1.contains("^[a-z0-9-]{1,63}$"));
    }
}
