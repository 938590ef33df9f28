//! Reverse-proxy tenant map.
//!
//! The ConfigMap maps every live tenant short name to the storage group
//! serving it. It is always rewritten whole, through the orchestrator's
//! compare-and-set, and a lost race re-reads and retries.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::{ConfigMap, Orchestrator};
use crate::directory::Directory;
use crate::error::AdapterError;

/// Compare-and-set rounds before giving the conflict back to the caller.
const MAX_CAS_ROUNDS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Unchanged,
    Created,
    Replaced,
}

pub struct ProxySync {
    orchestrator: Arc<dyn Orchestrator>,
    directory: Arc<dyn Directory>,
    config_map_name: String,
    lock: Mutex<()>,
}

impl ProxySync {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        directory: Arc<dyn Directory>,
        config_map_name: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            directory,
            config_map_name: config_map_name.into(),
            lock: Mutex::new(()),
        }
    }

    /// The map this process would write right now.
    pub async fn desired(&self) -> Result<BTreeMap<String, String>, AdapterError> {
        let mut data = BTreeMap::new();
        for tenant in self.directory.live_tenants().await? {
            let group = self
                .orchestrator
                .storage_group(&tenant)
                .await?
                .unwrap_or_else(|| tenant.clone());
            data.insert(tenant, group);
        }
        Ok(data)
    }

    /// Write the current tenant set. Writes are serialized inside this
    /// process; across processes the resource version decides.
    pub async fn sync(&self) -> Result<ProxyOutcome, AdapterError> {
        let _guard = self.lock.lock().await;
        let mut round = 0;
        loop {
            round += 1;
            let data = self.desired().await?;
            let current = self.orchestrator.get_config_map(&self.config_map_name).await?;
            let result = match current {
                Some(existing) if existing.data == data => {
                    debug!(config_map = %self.config_map_name, "Proxy map already current");
                    return Ok(ProxyOutcome::Unchanged);
                }
                Some(existing) => self
                    .orchestrator
                    .replace_config_map(&ConfigMap {
                        name: self.config_map_name.clone(),
                        data,
                        resource_version: existing.resource_version,
                    })
                    .await
                    .map(|_| ProxyOutcome::Replaced),
                None => self
                    .orchestrator
                    .create_config_map(&ConfigMap {
                        name: self.config_map_name.clone(),
                        data,
                        resource_version: None,
                    })
                    .await
                    .map(|_| ProxyOutcome::Created),
            };
            match result {
                Ok(outcome) => {
                    info!(config_map = %self.config_map_name, ?outcome, "Proxy map written");
                    return Ok(outcome);
                }
                Err(AdapterError::Conflict(reason)) if round < MAX_CAS_ROUNDS => {
                    warn!(config_map = %self.config_map_name, round, %reason, "Proxy map changed underneath, re-reading");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
