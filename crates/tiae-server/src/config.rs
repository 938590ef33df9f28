//! Process configuration assembled from the environment.

use std::env;
use std::time::Duration;

use thiserror::Error;
use tiae_auth::{AuthConfig, AuthError};
use tiae_db::{DbConfig, DbError};
use tiae_sync::{AdapterError, ObjectStoreConfig, SyncConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    ObjectStore(#[from] AdapterError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// External identity provider. Only carried through; discovery and the
/// OAuth exchange happen elsewhere.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityProviderConfig {
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
    pub callback: String,
}

impl IdentityProviderConfig {
    /// `None` unless `IDENTITY_PROVIDER_URL` is set.
    pub fn from_env() -> Option<Self> {
        let url = env::var("IDENTITY_PROVIDER_URL").ok()?;
        if url.trim().is_empty() {
            return None;
        }
        Some(Self {
            url,
            client_id: env::var("IDENTITY_PROVIDER_CLIENT_ID").unwrap_or_default(),
            client_secret: env::var("IDENTITY_PROVIDER_SECRET").unwrap_or_default(),
            callback: env::var("IDENTITY_PROVIDER_CALLBACK").unwrap_or_default(),
        })
    }
}

impl std::fmt::Debug for IdentityProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityProviderConfig")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("callback", &self.callback)
            .finish()
    }
}

/// Links in outgoing email point at the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteConfig {
    pub console_base_url: String,
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            console_base_url: "http://localhost:9080".into(),
        }
    }
}

impl InviteConfig {
    pub fn from_env() -> Self {
        match env::var("CONSOLE_BASE_URL") {
            Ok(url) if !url.trim().is_empty() => Self {
                console_base_url: url.trim().trim_end_matches('/').to_string(),
            },
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db: DbConfig,
    pub auth: AuthConfig,
    pub sync: SyncConfig,
    pub object_store: ObjectStoreConfig,
    pub invite: InviteConfig,
    pub identity_provider: Option<IdentityProviderConfig>,
    /// Interval of the stale-session sweep.
    pub session_sweep_interval: Duration,
    /// Talk to the Kubernetes API from inside the cluster instead of
    /// keeping orchestrator state in memory.
    pub in_cluster: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let sweep_secs = match env::var("SESSION_SWEEP_SECS") {
            Ok(raw) => raw
                .parse::<u64>()
                .map_err(|_| ConfigError::Invalid(format!("SESSION_SWEEP_SECS={raw}")))?,
            Err(_) => 300,
        };
        Ok(Self {
            db: DbConfig::from_env()?,
            auth: AuthConfig::from_env()?,
            sync: SyncConfig::from_env(),
            object_store: ObjectStoreConfig::from_env()?,
            invite: InviteConfig::from_env(),
            identity_provider: IdentityProviderConfig::from_env(),
            session_sweep_interval: Duration::from_secs(sweep_secs.max(1)),
            in_cluster: env::var("KUBERNETES_SERVICE_HOST").is_ok(),
        })
    }
}
