//! Configuration for post-commit synchronization.

use std::env;
use std::time::Duration;

use crate::error::AdapterError;
use crate::retry::RetryPolicy;

/// Name of the ConfigMap holding the reverse-proxy tenant map.
pub const PROXY_CONFIG_MAP: &str = "nginx-configuration";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Namespace holding the proxy ConfigMap and tenant secrets.
    pub namespace: String,
    pub config_map_name: String,
    pub retry: RetryPolicy,
    /// Deadline for a single attempt against an external system.
    pub call_timeout: Duration,
    /// Capacity of the reconciliation event channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            config_map_name: PROXY_CONFIG_MAP.into(),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(4),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `KUBERNETES_NAMESPACE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(ns) = env::var("KUBERNETES_NAMESPACE") {
            if !ns.trim().is_empty() {
                config.namespace = ns.trim().to_string();
            }
        }
        config
    }
}

/// Where object-store IAM lives. There is no default: the process must be
/// pointed at an admin gateway or told to keep IAM in memory.
#[derive(Clone, PartialEq, Eq)]
pub enum ObjectStoreConfig {
    Http { url: String, token: String },
    InMemory,
}

impl ObjectStoreConfig {
    /// Reads `OBJECT_STORE_ADMIN_URL` and `OBJECT_STORE_ADMIN_TOKEN`, or
    /// `OBJECT_STORE_IN_MEMORY=true`.
    pub fn from_env() -> Result<Self, AdapterError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AdapterError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        match get("OBJECT_STORE_ADMIN_URL") {
            Some(url) => {
                let token = get("OBJECT_STORE_ADMIN_TOKEN").ok_or_else(|| {
                    AdapterError::Config("OBJECT_STORE_ADMIN_TOKEN is not set".into())
                })?;
                Ok(Self::Http { url, token })
            }
            None if get("OBJECT_STORE_IN_MEMORY").as_deref() == Some("true") => Ok(Self::InMemory),
            None => Err(AdapterError::Config(
                "set OBJECT_STORE_ADMIN_URL, or OBJECT_STORE_IN_MEMORY=true for local runs".into(),
            )),
        }
    }
}

impl std::fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http { url, .. } => f
                .debug_struct("Http")
                .field("url", url)
                .field("token", &"<redacted>")
                .finish(),
            Self::InMemory => f.write_str("InMemory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn object_store_must_be_chosen() {
        let err = ObjectStoreConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
        let err = ObjectStoreConfig::from_lookup(lookup(&[("OBJECT_STORE_IN_MEMORY", "yes")]))
            .unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn gateway_needs_a_token() {
        let err = ObjectStoreConfig::from_lookup(lookup(&[(
            "OBJECT_STORE_ADMIN_URL",
            "http://gw:9000",
        )]))
        .unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));

        let config = ObjectStoreConfig::from_lookup(lookup(&[
            ("OBJECT_STORE_ADMIN_URL", "http://gw:9000"),
            ("OBJECT_STORE_ADMIN_TOKEN", "hunter2"),
        ]))
        .unwrap();
        assert_eq!(
            config,
            ObjectStoreConfig::Http {
                url: "http://gw:9000".into(),
                token: "hunter2".into()
            }
        );
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn in_memory_is_opt_in() {
        let config =
            ObjectStoreConfig::from_lookup(lookup(&[("OBJECT_STORE_IN_MEMORY", "true")])).unwrap();
        assert_eq!(config, ObjectStoreConfig::InMemory);
    }
}
