//! Orchestrator access: the reverse-proxy ConfigMap, tenant secrets and
//! the tenant → storage-group mapping.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AdapterError;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMap {
    pub name: String,
    pub data: BTreeMap<String, String>,
    /// Opaque version for compare-and-set; `None` before creation.
    pub resource_version: Option<String>,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, AdapterError>;

    /// Fails with `Conflict` when the map already exists.
    async fn create_config_map(&self, map: &ConfigMap) -> Result<ConfigMap, AdapterError>;

    /// Replace a map whose resource version still matches. Fails with
    /// `Conflict` otherwise.
    async fn replace_config_map(&self, map: &ConfigMap) -> Result<ConfigMap, AdapterError>;

    async fn upsert_secret(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), AdapterError>;

    /// Storage group serving `tenant`, if the orchestrator knows one.
    async fn storage_group(&self, tenant: &str) -> Result<Option<String>, AdapterError>;
}

#[derive(Debug, Default)]
struct OrchestratorState {
    config_maps: HashMap<String, (ConfigMap, u64)>,
    secrets: HashMap<String, BTreeMap<String, String>>,
    storage_groups: HashMap<String, String>,
    writes: HashMap<String, u64>,
    conflicts: u32,
}

/// In-memory orchestrator with real resource-version checks.
#[derive(Debug, Default)]
pub struct InMemoryOrchestrator {
    state: Mutex<OrchestratorState>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_storage_group(&self, tenant: &str, group: &str) {
        self.state
            .lock()
            .await
            .storage_groups
            .insert(tenant.into(), group.into());
    }

    pub async fn secret(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().await.secrets.get(name).cloned()
    }

    /// Make the next `times` replaces lose their compare-and-set.
    pub async fn inject_conflicts(&self, times: u32) {
        self.state.lock().await.conflicts = times;
    }

    /// Number of successful create/replace calls on `name`.
    pub async fn config_map_writes(&self, name: &str) -> u64 {
        self.state
            .lock()
            .await
            .writes
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, AdapterError> {
        Ok(self
            .state
            .lock()
            .await
            .config_maps
            .get(name)
            .map(|(m, _)| m.clone()))
    }

    async fn create_config_map(&self, map: &ConfigMap) -> Result<ConfigMap, AdapterError> {
        let mut state = self.state.lock().await;
        if state.config_maps.contains_key(&map.name) {
            return Err(AdapterError::Conflict(format!("{} already exists", map.name)));
        }
        let stored = ConfigMap {
            resource_version: Some("1".into()),
            ..map.clone()
        };
        state
            .config_maps
            .insert(map.name.clone(), (stored.clone(), 1));
        *state.writes.entry(map.name.clone()).or_default() += 1;
        Ok(stored)
    }

    async fn replace_config_map(&self, map: &ConfigMap) -> Result<ConfigMap, AdapterError> {
        let mut state = self.state.lock().await;
        if state.conflicts > 0 {
            state.conflicts -= 1;
            if let Some((current, version)) = state.config_maps.get_mut(&map.name) {
                *version += 1;
                current.resource_version = Some(version.to_string());
            }
            return Err(AdapterError::Conflict("injected conflict".into()));
        }
        let (current, version) = state
            .config_maps
            .get_mut(&map.name)
            .ok_or_else(|| AdapterError::NotFound(format!("configmap {}", map.name)))?;
        if current.resource_version != map.resource_version {
            return Err(AdapterError::Conflict(format!(
                "{} changed since it was read",
                map.name
            )));
        }
        *version += 1;
        *current = ConfigMap {
            resource_version: Some(version.to_string()),
            ..map.clone()
        };
        let stored = current.clone();
        *state.writes.entry(map.name.clone()).or_default() += 1;
        Ok(stored)
    }

    async fn upsert_secret(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), AdapterError> {
        self.state.lock().await.secrets.insert(name.into(), data);
        Ok(())
    }

    async fn storage_group(&self, tenant: &str) -> Result<Option<String>, AdapterError> {
        Ok(self.state.lock().await.storage_groups.get(tenant).cloned())
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeConfigMap {
    api_version: String,
    kind: String,
    metadata: ObjectMeta,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KubeSecret {
    api_version: &'static str,
    kind: &'static str,
    metadata: ObjectMeta,
    #[serde(rename = "type")]
    secret_type: &'static str,
    string_data: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ServiceList {
    #[serde(default)]
    items: Vec<ServiceItem>,
}

#[derive(Debug, Deserialize)]
struct ServiceItem {
    metadata: ObjectMeta,
}

/// Kubernetes REST API client authenticated with a bearer token.
pub struct KubeRestOrchestrator {
    client: Client,
    base_url: String,
    namespace: String,
    token: String,
}

impl KubeRestOrchestrator {
    pub fn new(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            token: token.into(),
        })
    }

    /// Build a client from the pod's service-account mount and the
    /// `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` variables.
    pub fn in_cluster(namespace: &str, timeout: Duration) -> Result<Self, AdapterError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| AdapterError::Config("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .map_err(|e| AdapterError::Config(format!("service account token: {e}")))?;
        let ca = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .map_err(|e| AdapterError::Config(format!("service account CA: {e}")))?;
        let ca = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| AdapterError::Config(format!("service account CA: {e}")))?;

        let client = Client::builder()
            .timeout(timeout)
            .add_root_certificate(ca)
            .build()
            .map_err(|e| AdapterError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: format!("https://{host}:{port}"),
            namespace: namespace.to_string(),
            token: token.trim().to_string(),
        })
    }

    fn url(&self, kind: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!(
                "{}/api/v1/namespaces/{}/{kind}/{name}",
                self.base_url, self.namespace
            ),
            None => format!("{}/api/v1/namespaces/{}/{kind}", self.base_url, self.namespace),
        }
    }

    fn to_kube(&self, map: &ConfigMap) -> KubeConfigMap {
        KubeConfigMap {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            metadata: ObjectMeta {
                name: map.name.clone(),
                namespace: Some(self.namespace.clone()),
                resource_version: map.resource_version.clone(),
                labels: BTreeMap::new(),
            },
            data: map.data.clone(),
        }
    }
}

fn from_kube(map: KubeConfigMap) -> ConfigMap {
    ConfigMap {
        name: map.metadata.name,
        data: map.data,
        resource_version: map.metadata.resource_version,
    }
}

/// Map a non-success status to an adapter error.
pub(super) fn status_error(status: StatusCode, what: &str) -> AdapterError {
    match status {
        StatusCode::CONFLICT => AdapterError::Conflict(format!("{what}: {status}")),
        StatusCode::NOT_FOUND => AdapterError::NotFound(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS => AdapterError::Transient(format!("{what}: {status}")),
        s if s.is_server_error() => AdapterError::Transient(format!("{what}: {status}")),
        s => AdapterError::Rejected(format!("{what}: {s}")),
    }
}

#[async_trait]
impl Orchestrator for KubeRestOrchestrator {
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, AdapterError> {
        let response = self
            .client
            .get(self.url("configmaps", Some(name)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(from_kube(response.json().await?))),
            s => Err(status_error(s, name)),
        }
    }

    async fn create_config_map(&self, map: &ConfigMap) -> Result<ConfigMap, AdapterError> {
        let response = self
            .client
            .post(self.url("configmaps", None))
            .bearer_auth(&self.token)
            .json(&self.to_kube(map))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), &map.name));
        }
        Ok(from_kube(response.json().await?))
    }

    async fn replace_config_map(&self, map: &ConfigMap) -> Result<ConfigMap, AdapterError> {
        let response = self
            .client
            .put(self.url("configmaps", Some(&map.name)))
            .bearer_auth(&self.token)
            .json(&self.to_kube(map))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), &map.name));
        }
        Ok(from_kube(response.json().await?))
    }

    async fn upsert_secret(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), AdapterError> {
        let body = KubeSecret {
            api_version: "v1",
            kind: "Secret",
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: Some(self.namespace.clone()),
                ..ObjectMeta::default()
            },
            secret_type: "Opaque",
            string_data: data,
        };
        let response = self
            .client
            .put(self.url("secrets", Some(name)))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status != StatusCode::NOT_FOUND {
            return Err(status_error(status, name));
        }

        debug!(secret = name, "Secret missing, creating");
        let response = self
            .client
            .post(self.url("secrets", None))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), name));
        }
        Ok(())
    }

    async fn storage_group(&self, tenant: &str) -> Result<Option<String>, AdapterError> {
        let response = self
            .client
            .get(self.url("services", None))
            .query(&[("labelSelector", format!("tenant={tenant}"))])
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), tenant));
        }
        let list: ServiceList = response.json().await?;
        Ok(list.items.into_iter().next().map(|s| s.metadata.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(data: &[(&str, &str)], rv: Option<&str>) -> ConfigMap {
        ConfigMap {
            name: "nginx-configuration".into(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            resource_version: rv.map(String::from),
        }
    }

    #[tokio::test]
    async fn stale_replace_is_a_conflict() {
        let orch = InMemoryOrchestrator::new();
        let created = orch.create_config_map(&map(&[], None)).await.unwrap();
        let updated = orch
            .replace_config_map(&map(&[("acme", "sg-1")], created.resource_version.as_deref()))
            .await
            .unwrap();
        assert_ne!(updated.resource_version, created.resource_version);

        let err = orch
            .replace_config_map(&map(&[("beta", "sg-1")], created.resource_version.as_deref()))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Conflict(_)));
        assert_eq!(orch.config_map_writes("nginx-configuration").await, 2);
    }

    #[test]
    fn status_codes_classify() {
        assert!(matches!(
            status_error(StatusCode::CONFLICT, "x"),
            AdapterError::Conflict(_)
        ));
        assert!(status_error(StatusCode::BAD_GATEWAY, "x").is_transient());
        assert!(!status_error(StatusCode::FORBIDDEN, "x").is_transient());
    }

    #[test]
    fn config_map_wire_shape() {
        let orch = KubeRestOrchestrator::new(
            "https://k8s.local/",
            "storage",
            "token",
            Duration::from_secs(4),
        )
        .unwrap();
        let json = serde_json::to_value(orch.to_kube(&map(&[("acme", "sg-1")], Some("7")))).unwrap();
        assert_eq!(json["apiVersion"], "v1");
        assert_eq!(json["metadata"]["resourceVersion"], "7");
        assert_eq!(json["metadata"]["namespace"], "storage");
        assert_eq!(json["data"]["acme"], "sg-1");
        assert_eq!(
            orch.url("configmaps", Some("nginx-configuration")),
            "https://k8s.local/api/v1/namespaces/storage/configmaps/nginx-configuration"
        );
    }
}
