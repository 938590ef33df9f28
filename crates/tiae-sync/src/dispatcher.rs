//! Runs the effects a committed context staged.
//!
//! Nothing here can fail the request that staged the effects: the
//! database already committed. Each effect is retried on its own; one
//! that gives up is reported as a [`ReconciliationNeeded`] event and the
//! remaining effects still run.

use std::collections::BTreeMap;
use std::sync::Arc;

use tiae_core::effects::{PostCommit, ordered};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{EmailSender, Orchestrator};
use crate::config::SyncConfig;
use crate::directory::Directory;
use crate::events::{EventBus, ReconciliationNeeded};
use crate::proxy::ProxySync;
use crate::retry::{RetryError, retry};
use crate::synchronizer::AuthorizationSynchronizer;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub completed: usize,
    pub superseded: usize,
    pub incidents: Vec<ReconciliationNeeded>,
}

pub struct Dispatcher {
    synchronizer: Arc<AuthorizationSynchronizer>,
    proxy: Arc<ProxySync>,
    orchestrator: Arc<dyn Orchestrator>,
    email: Arc<dyn EmailSender>,
    directory: Arc<dyn Directory>,
    events: EventBus,
    config: SyncConfig,
    shutdown: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        synchronizer: Arc<AuthorizationSynchronizer>,
        proxy: Arc<ProxySync>,
        orchestrator: Arc<dyn Orchestrator>,
        email: Arc<dyn EmailSender>,
        directory: Arc<dyn Directory>,
        events: EventBus,
        config: SyncConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            synchronizer,
            proxy,
            orchestrator,
            email,
            directory,
            events,
            config,
            shutdown,
        }
    }

    pub fn synchronizer(&self) -> &Arc<AuthorizationSynchronizer> {
        &self.synchronizer
    }

    pub fn proxy(&self) -> &Arc<ProxySync> {
        &self.proxy
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Cancelled when the process begins shutting down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run `effects` in the background.
    pub fn spawn(self: &Arc<Self>, effects: Vec<PostCommit>) -> Option<JoinHandle<DispatchReport>> {
        if effects.is_empty() {
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.dispatch(effects).await }))
    }

    /// Run `effects` in phase order and wait for all of them.
    pub async fn dispatch(&self, effects: Vec<PostCommit>) -> DispatchReport {
        let mut report = DispatchReport::default();
        for effect in ordered(effects) {
            let label = effect.target();
            match self.run(&effect, &label).await {
                Ok(()) => {
                    debug!(effect = %label, "Post-commit action done");
                    report.completed += 1;
                }
                Err(RetryError::Superseded { attempts }) => {
                    debug!(effect = %label, attempts, "Post-commit action superseded");
                    report.superseded += 1;
                }
                Err(err) => {
                    let last_error = match err.last_error() {
                        Some(e) => e.to_string(),
                        None => "shut down before completion".to_string(),
                    };
                    let event = ReconciliationNeeded {
                        target: label,
                        attempts: err.attempts(),
                        last_error,
                        incident_id: Uuid::new_v4(),
                    };
                    self.events.publish(event.clone());
                    report.incidents.push(event);
                }
            }
        }
        if !report.incidents.is_empty() {
            warn!(
                completed = report.completed,
                incidents = report.incidents.len(),
                "Post-commit dispatch finished with incidents"
            );
        }
        report
    }

    async fn run(&self, effect: &PostCommit, label: &str) -> Result<(), RetryError> {
        let policy = &self.config.retry;
        let timeout = self.config.call_timeout;
        let cancel = &self.shutdown;
        match effect {
            PostCommit::ProvisionServiceAccount {
                tenant,
                service_account_id,
                access_key,
                secret_key,
            } => {
                self.synchronizer.begin(tenant, *service_account_id);
                retry(policy, timeout, cancel, label, || true, || {
                    self.synchronizer
                        .provision(tenant, *service_account_id, access_key, secret_key)
                })
                .await?;
            }
            PostCommit::SyncServiceAccount {
                tenant,
                service_account_id,
            } => {
                let generation = self.synchronizer.begin(tenant, *service_account_id);
                retry(
                    policy,
                    timeout,
                    cancel,
                    label,
                    || self.synchronizer.is_current(tenant, *service_account_id, generation),
                    || self.synchronizer.sync(tenant, *service_account_id),
                )
                .await?;
            }
            PostCommit::RemoveServiceAccount {
                tenant,
                service_account_id,
                access_key,
            } => {
                retry(policy, timeout, cancel, label, || true, || {
                    self.synchronizer
                        .remove(tenant, *service_account_id, access_key)
                })
                .await?;
            }
            PostCommit::StoreTenantCredentials {
                tenant,
                access_key,
                secret_key,
            } => {
                let name = format!("{tenant}-env");
                let data = BTreeMap::from([
                    ("accesskey".to_string(), access_key.clone()),
                    ("secretkey".to_string(), secret_key.clone()),
                ]);
                retry(policy, timeout, cancel, label, || true, || {
                    self.orchestrator.upsert_secret(&name, data.clone())
                })
                .await?;
                info!(%tenant, secret = %name, "Tenant credentials stored");
            }
            PostCommit::SyncProxyConfig => {
                retry(policy, timeout, cancel, label, || true, || self.proxy.sync()).await?;
            }
            PostCommit::SendEmail(email) => {
                retry(policy, timeout, cancel, label, || true, || {
                    self.email.send(&email.to, &email.subject, &email.body)
                })
                .await?;
            }
            PostCommit::EvictTenantConnection { tenant } => {
                self.directory.evict_tenant(tenant).await;
                self.synchronizer.forget_tenant(tenant);
            }
        }
        Ok(())
    }
}
