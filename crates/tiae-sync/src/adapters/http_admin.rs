//! Object-store IAM administration over the storage admin gateway's REST
//! API.
//!
//! Every tenant's IAM lives under `{base}/tenants/{tenant}`:
//!
//! | call                   | request                                   |
//! |------------------------|-------------------------------------------|
//! | `add_user`             | `PUT users/{key}` `{"secretKey"}`         |
//! | `set_user_status`      | `PUT users/{key}/status` `{"enabled"}`    |
//! | `add_canned_policy`    | `PUT policies/{name}` with the document   |
//! | `set_policy`           | `PUT users/{key}/policy` `{"policy"}`     |
//! | `remove_user`          | `DELETE users/{key}`                      |
//! | `get_user_info`        | `GET users/{key}`                         |
//! | `remove_canned_policy` | `DELETE policies/{name}`                  |
//!
//! Deletes of missing objects succeed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::object_store::{AdminClientProvider, ObjectStoreAdmin, UserInfo};
use super::orchestrator::status_error;
use crate::error::AdapterError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserSecret<'a> {
    secret_key: &'a str,
}

#[derive(Serialize)]
struct UserStatus {
    enabled: bool,
}

#[derive(Serialize)]
struct PolicyAttachment<'a> {
    policy: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    enabled: bool,
    #[serde(default)]
    policy_name: Option<String>,
}

/// Hands out gateway clients scoped to one tenant. All of them share one
/// connection pool.
pub struct HttpAdminProvider {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpAdminProvider {
    pub fn new(
        base_url: impl Into<String>,
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
            token: token.into(),
        })
    }
}

#[async_trait]
impl AdminClientProvider for HttpAdminProvider {
    async fn admin_client(&self, tenant: &str) -> Result<Arc<dyn ObjectStoreAdmin>, AdapterError> {
        if tenant.is_empty() || !tenant.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(AdapterError::Rejected(format!("tenant name {tenant:?}")));
        }
        Ok(Arc::new(HttpObjectStoreAdmin {
            client: self.client.clone(),
            tenant_url: format!("{}/tenants/{tenant}", self.base_url),
            token: self.token.clone(),
        }))
    }
}

/// IAM of one tenant behind the admin gateway.
pub struct HttpObjectStoreAdmin {
    client: Client,
    tenant_url: String,
    token: String,
}

impl HttpObjectStoreAdmin {
    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.tenant_url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, AdapterError> {
        Ok(request.bearer_auth(&self.token).send().await?)
    }

    /// Succeed on 2xx, otherwise map the status.
    async fn expect_success(&self, request: RequestBuilder, what: &str) -> Result<(), AdapterError> {
        let response = self.send(request).await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(status_error(response.status(), what))
    }

    /// Like [`Self::expect_success`], but a missing object is already gone.
    async fn delete(&self, path: &str, what: &str) -> Result<(), AdapterError> {
        let response = self.send(self.client.delete(self.url(path))).await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(object = what, "Already absent");
                Ok(())
            }
            s if s.is_success() => Ok(()),
            s => Err(status_error(s, what)),
        }
    }
}

#[async_trait]
impl ObjectStoreAdmin for HttpObjectStoreAdmin {
    async fn add_user(&self, access_key: &str, secret_key: &str) -> Result<(), AdapterError> {
        let request = self
            .client
            .put(self.url(&format!("users/{access_key}")))
            .json(&UserSecret { secret_key });
        self.expect_success(request, access_key).await
    }

    async fn set_user_status(&self, access_key: &str, enabled: bool) -> Result<(), AdapterError> {
        let request = self
            .client
            .put(self.url(&format!("users/{access_key}/status")))
            .json(&UserStatus { enabled });
        self.expect_success(request, access_key).await
    }

    async fn add_canned_policy(&self, name: &str, document: &str) -> Result<(), AdapterError> {
        let request = self
            .client
            .put(self.url(&format!("policies/{name}")))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(document.to_string());
        self.expect_success(request, name).await
    }

    async fn set_policy(
        &self,
        policy_name: &str,
        user_or_group: &str,
        is_group: bool,
    ) -> Result<(), AdapterError> {
        let kind = if is_group { "groups" } else { "users" };
        let request = self
            .client
            .put(self.url(&format!("{kind}/{user_or_group}/policy")))
            .json(&PolicyAttachment {
                policy: policy_name,
            });
        self.expect_success(request, user_or_group).await
    }

    async fn remove_user(&self, access_key: &str) -> Result<(), AdapterError> {
        self.delete(&format!("users/{access_key}"), access_key).await
    }

    async fn get_user_info(&self, access_key: &str) -> Result<Option<UserInfo>, AdapterError> {
        let response = self
            .send(self.client.get(self.url(&format!("users/{access_key}"))))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let record: UserRecord = response.json().await?;
                Ok(Some(UserInfo {
                    enabled: record.enabled,
                    policy_name: record.policy_name.filter(|p| !p.is_empty()),
                }))
            }
            s => Err(status_error(s, access_key)),
        }
    }

    async fn remove_canned_policy(&self, name: &str) -> Result<(), AdapterError> {
        self.delete(&format!("policies/{name}"), name).await
    }
}
