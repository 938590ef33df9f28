//! Postgres connection management.
//!
//! The [`ConnectionRegistry`] owns one pool for the global catalog
//! (`provisioning` database) and lazily creates one pool per tenant against
//! the `tenants` database, each pinned to the tenant's schema through
//! `search_path`.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use tiae_core::validation::validate_short_name;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::DbError;

/// Configuration for connecting to Postgres.
#[derive(Clone)]
pub struct DbConfig {
    /// Full connection URL. When set it replaces host, port, user,
    /// password and SSL mode.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Database holding the global catalog.
    pub database: String,
    /// Database holding one schema per tenant.
    pub tenants_database: String,
    /// Schema of the global catalog inside `database`.
    pub schema: String,
    pub ssl_mode: PgSslMode,
    pub max_connections: u32,
    /// Pool size of each per-tenant pool.
    pub tenant_max_connections: u32,
    pub acquire_timeout: Duration,
    /// Server-side `statement_timeout` applied to every connection.
    pub statement_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: String::new(),
            database: "provisioning".into(),
            tenants_database: "tenants".into(),
            schema: "provisioning".into(),
            ssl_mode: PgSslMode::Disable,
            max_connections: 10,
            tenant_max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
            statement_timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("tenants_database", &self.tenants_database)
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl DbConfig {
    /// Read `DB_HOSTNAME`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`, `DB_NAME`,
    /// `DB_SSL`, `DB_SCHEMA`, `DB_TENANTS_NAME` and `DB_MAX_CONNECTIONS`,
    /// falling back to the defaults for anything unset.
    pub fn from_env() -> Result<Self, DbError> {
        let defaults = Self::default();
        let port = match env::var("DB_PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| DbError::Config(format!("DB_PORT={raw:?}: {e}")))?,
            Err(_) => defaults.port,
        };
        let max_connections = match env::var("DB_MAX_CONNECTIONS") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| DbError::Config(format!("DB_MAX_CONNECTIONS={raw:?}: {e}")))?,
            Err(_) => defaults.max_connections,
        };
        let ssl_mode = match env::var("DB_SSL") {
            Ok(raw) => parse_ssl_mode(&raw)?,
            Err(_) => defaults.ssl_mode,
        };
        let schema = env::var("DB_SCHEMA").unwrap_or(defaults.schema);
        validate_short_name(&schema)
            .map_err(|_| DbError::Config(format!("DB_SCHEMA={schema:?} is not a valid schema")))?;

        Ok(Self {
            url: None,
            host: env::var("DB_HOSTNAME").unwrap_or(defaults.host),
            port,
            user: env::var("DB_USER").unwrap_or(defaults.user),
            password: env::var("DB_PASSWORD").unwrap_or_default(),
            database: env::var("DB_NAME").unwrap_or(defaults.database),
            tenants_database: env::var("DB_TENANTS_NAME").unwrap_or(defaults.tenants_database),
            schema,
            ssl_mode,
            max_connections,
            ..defaults
        })
    }

    /// Point both logical databases at the database named in `url`.
    /// Used by tests and single-database deployments.
    pub fn for_url(url: &str) -> Result<Self, DbError> {
        let options = PgConnectOptions::from_str(url)?;
        let database = options.get_database().unwrap_or("postgres").to_string();
        Ok(Self {
            url: Some(url.to_string()),
            database: database.clone(),
            tenants_database: database,
            ..Self::default()
        })
    }

    fn base_options(&self) -> Result<PgConnectOptions, DbError> {
        let options = match &self.url {
            Some(url) => PgConnectOptions::from_str(url)?,
            None => PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.user)
                .password(&self.password)
                .ssl_mode(self.ssl_mode),
        };
        Ok(options.application_name("tiae"))
    }

    fn statement_timeout_ms(&self) -> String {
        self.statement_timeout.as_millis().to_string()
    }

    /// Options for the global-catalog pool.
    pub fn provisioning_options(&self) -> Result<PgConnectOptions, DbError> {
        Ok(self.base_options()?.database(&self.database).options([
            ("search_path", self.schema.clone()),
            ("statement_timeout", self.statement_timeout_ms()),
        ]))
    }

    /// Options for tenant pools. The schema is selected after connect.
    pub fn tenant_options(&self) -> Result<PgConnectOptions, DbError> {
        Ok(self
            .base_options()?
            .database(&self.tenants_database)
            .options([("statement_timeout", self.statement_timeout_ms())]))
    }
}

fn parse_ssl_mode(raw: &str) -> Result<PgSslMode, DbError> {
    match raw.to_ascii_lowercase().as_str() {
        "" | "false" | "off" => Ok(PgSslMode::Disable),
        "true" | "on" => Ok(PgSslMode::Require),
        other => {
            PgSslMode::from_str(other).map_err(|e| DbError::Config(format!("DB_SSL: {e}")))
        }
    }
}

/// Quote a validated short name for use as a schema identifier.
pub(crate) fn quote_schema(short_name: &str) -> Result<String, DbError> {
    validate_short_name(short_name)
        .map_err(|_| DbError::Config(format!("invalid schema name {short_name:?}")))?;
    Ok(format!("\"{short_name}\""))
}

/// Process-wide registry of database pools.
///
/// Constructed once at start-up and passed to every component by `Arc`.
/// Tenant pools are created on first use; creation is single-flight per
/// short name so concurrent first requests share one connect.
pub struct ConnectionRegistry {
    config: DbConfig,
    main: PgPool,
    tenants: DashMap<String, Arc<OnceCell<PgPool>>>,
}

impl ConnectionRegistry {
    /// Connect the global-catalog pool.
    pub async fn connect(config: DbConfig) -> Result<Self, DbError> {
        info!(
            host = %config.host,
            database = %config.database,
            schema = %config.schema,
            "Connecting to provisioning database"
        );
        let main = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(config.provisioning_options()?)
            .await?;
        info!("Successfully connected to provisioning database");
        Ok(Self::with_pool(config, main))
    }

    /// Build a registry around an already configured provisioning pool.
    pub fn with_pool(config: DbConfig, main: PgPool) -> Self {
        Self {
            config,
            main,
            tenants: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// The shared global-catalog pool.
    pub fn get_db(&self) -> &PgPool {
        &self.main
    }

    /// The pool of one tenant schema, created on first request.
    ///
    /// A failed connect leaves nothing cached; the next call retries.
    pub async fn get_tenant_db(&self, short_name: &str) -> Result<PgPool, DbError> {
        let cell = self
            .tenants
            .entry(short_name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let pool = cell
            .get_or_try_init(|| self.connect_tenant(short_name))
            .await?;
        Ok(pool.clone())
    }

    async fn connect_tenant(&self, short_name: &str) -> Result<PgPool, DbError> {
        let set_path = format!("SET search_path TO {}", quote_schema(short_name)?);
        debug!(tenant = %short_name, "Connecting tenant pool");
        let pool = PgPoolOptions::new()
            .max_connections(self.config.tenant_max_connections)
            .acquire_timeout(self.config.acquire_timeout)
            .after_connect(move |conn, _meta| {
                let sql = set_path.clone();
                Box::pin(async move {
                    sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&sql)).await?;
                    Ok(())
                })
            })
            .connect_with(self.config.tenant_options()?)
            .await?;
        Ok(pool)
    }

    /// Evict and close the pool of a tenant. No-op when nothing is cached.
    pub async fn remove_cnx(&self, short_name: &str) {
        if let Some((_, cell)) = self.tenants.remove(short_name) {
            if let Some(pool) = cell.get() {
                pool.close().await;
            }
            debug!(tenant = %short_name, "Evicted tenant pool");
        }
    }

    /// Number of tenant pools currently cached.
    pub fn cached_tenants(&self) -> usize {
        self.tenants.iter().filter(|e| e.value().initialized()).count()
    }

    /// Close every pool.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.tenants.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove_cnx(&key).await;
        }
        self.main.close().await;
        if !self.main.is_closed() {
            warn!("Provisioning pool did not close cleanly");
        }
        info!("Database pools closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DbConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.user, "postgres");
        assert_eq!(config.database, "provisioning");
        assert_eq!(config.schema, "provisioning");
        assert_eq!(config.statement_timeout, Duration::from_secs(10));
    }

    #[test]
    fn ssl_modes_parse() {
        assert!(matches!(parse_ssl_mode("disable"), Ok(PgSslMode::Disable)));
        assert!(matches!(parse_ssl_mode("require"), Ok(PgSslMode::Require)));
        assert!(matches!(parse_ssl_mode("verify-full"), Ok(PgSslMode::VerifyFull)));
        assert!(matches!(parse_ssl_mode("true"), Ok(PgSslMode::Require)));
        assert!(parse_ssl_mode("sometimes").is_err());
    }

    #[test]
    fn schema_quoting_rejects_bad_names() {
        assert_eq!(quote_schema("acme").unwrap(), "\"acme\"");
        assert!(quote_schema("acme\"; DROP SCHEMA x; --").is_err());
        assert!(quote_schema("").is_err());
    }

    #[test]
    fn for_url_uses_url_database_for_both_scopes() {
        let config = DbConfig::for_url("postgres://u:p@db.local:5433/tiae_test").unwrap();
        assert_eq!(config.database, "tiae_test");
        assert_eq!(config.tenants_database, "tiae_test");
    }

    #[test]
    fn debug_omits_password() {
        let config = DbConfig {
            password: "hunter2".into(),
            ..DbConfig::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn lazy_registry_caches_nothing_until_asked() {
        let config = DbConfig::default();
        let pool = PgPoolOptions::new().connect_lazy_with(config.provisioning_options().unwrap());
        let registry = ConnectionRegistry::with_pool(config, pool);
        assert_eq!(registry.cached_tenants(), 0);
        registry.remove_cnx("missing").await;
        assert_eq!(registry.cached_tenants(), 0);
    }
}
